//! TXT lookups used to check challenge record propagation.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};

use crate::error::{Error, Result};

/// Public recursive resolvers queried when none are configured.
pub const DEFAULT_NAMESERVERS: [SocketAddr; 2] = [
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(223, 5, 5, 5), 53)),
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(223, 6, 6, 6), 53)),
];

#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Returns the TXT values currently published at `name`.
    ///
    /// A name without TXT records yields an empty list, not an error.
    async fn txt_records(&self, name: &str) -> Result<Vec<String>>;
}

/// Resolves through an explicit set of recursive nameservers with caching disabled.
///
/// The system resolver may still cache a negative answer for the challenge record from before
/// it was created, so it is never consulted.
pub struct RecursiveResolver {
    resolver: TokioAsyncResolver,
}

impl RecursiveResolver {
    pub fn new(nameservers: &[SocketAddr]) -> Result<Self> {
        if nameservers.is_empty() {
            return Err(Error::Config("at least one nameserver is required".to_owned()));
        }

        let mut config = ResolverConfig::new();
        for addr in nameservers {
            config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        opts.cache_size = 0;

        Ok(RecursiveResolver {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl TxtResolver for RecursiveResolver {
    async fn txt_records(&self, name: &str) -> Result<Vec<String>> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    // long values arrive split into several character strings
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),

            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(Error::transport(&format!("TXT lookup for {name}"), err)),
            },
        }
    }
}

impl std::fmt::Debug for RecursiveResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursiveResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_nameservers() {
        assert_eq!(DEFAULT_NAMESERVERS[0].to_string(), "223.5.5.5:53");
        assert_eq!(DEFAULT_NAMESERVERS[1].to_string(), "223.6.6.6:53");
    }

    #[tokio::test]
    async fn test_requires_nameserver() {
        assert!(matches!(
            RecursiveResolver::new(&[]),
            Err(Error::Config(_))
        ));
        assert!(RecursiveResolver::new(&DEFAULT_NAMESERVERS).is_ok());
    }
}
