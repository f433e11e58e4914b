use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

use crate::{
    acme::DirectoryUrl,
    domain::Domain,
    error::{Error, Result},
    poll::Poller,
    resolver::DEFAULT_NAMESERVERS,
};

pub const DEFAULT_REGION: &str = "cn-hangzhou";
pub const DEFAULT_CERT_DIR: &str = "certificates";

/// Challenge record propagation: check every 2 s for up to 60 s.
pub const DEFAULT_PROPAGATION: Poller = Poller::new(Duration::from_secs(2), Duration::from_secs(60));

/// Order status: check every 2 s for up to 90 s.
pub const DEFAULT_ORDER: Poller = Poller::new(Duration::from_secs(2), Duration::from_secs(90));

/// Upper bound for any poll interval or timeout.
pub const MAX_POLL_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Which ACME directory certificates are requested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    /// Issue a certificate and store it locally.
    Obtain,
    /// Deploy a stored certificate to the CDN.
    Upload,
    /// `Obtain`, then `Upload` if that succeeded.
    Auto,
}

impl Workflow {
    pub fn obtains(self) -> bool {
        matches!(self, Workflow::Obtain | Workflow::Auto)
    }

    pub fn uploads(self) -> bool {
        matches!(self, Workflow::Upload | Workflow::Auto)
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Workflow::Obtain => "obtain",
            Workflow::Upload => "upload",
            Workflow::Auto => "auto",
        })
    }
}

/// Alibaba Cloud access key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, access_key_secret: impl Into<String>) -> Self {
        Credentials {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.access_key_id.trim().is_empty() && !self.access_key_secret.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .finish()
    }
}

/// Everything one run needs, resolved up front and handed to the components that use it.
#[derive(Debug, Clone)]
pub struct Config {
    pub workflow: Workflow,
    pub domain: Domain,
    /// ACME account contact. Needed to obtain certificates.
    pub email: Option<String>,
    pub dns_credentials: Option<Credentials>,
    pub cdn_credentials: Option<Credentials>,
    pub environment: Environment,
    /// Overrides the directory picked by `environment`.
    pub directory_url: Option<String>,
    /// CDN region the certificate is deployed in.
    pub region: String,
    pub cert_dir: PathBuf,
    /// Recursive resolvers used to observe challenge records.
    pub nameservers: Vec<SocketAddr>,
    pub propagation: Poller,
    pub order: Poller,
}

impl Config {
    /// A configuration with defaults for everything but the workflow and domain.
    pub fn new(workflow: Workflow, domain: Domain) -> Self {
        Config {
            workflow,
            domain,
            email: None,
            dns_credentials: None,
            cdn_credentials: None,
            environment: Environment::default(),
            directory_url: None,
            region: DEFAULT_REGION.to_owned(),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            nameservers: DEFAULT_NAMESERVERS.to_vec(),
            propagation: DEFAULT_PROPAGATION,
            order: DEFAULT_ORDER,
        }
    }

    /// Checks that everything the selected workflow needs is present.
    pub fn validate(&self) -> Result<()> {
        if self.workflow.obtains() {
            if self.email.as_deref().map_or(true, |email| email.trim().is_empty()) {
                return Err(missing("--email", self.workflow));
            }

            if !self.dns_credentials.as_ref().is_some_and(Credentials::is_complete) {
                return Err(missing("--dns-access-key and --dns-secret-key", self.workflow));
            }

            if self.nameservers.is_empty() {
                return Err(missing("--nameserver", self.workflow));
            }
        }

        if self.workflow.uploads() {
            if !self.cdn_credentials.as_ref().is_some_and(Credentials::is_complete) {
                return Err(missing("--cdn-access-key and --cdn-secret-key", self.workflow));
            }

            if self.region.trim().is_empty() {
                return Err(missing("--region", self.workflow));
            }
        }

        for poller in [&self.propagation, &self.order] {
            if poller.interval.is_zero() || poller.timeout.is_zero() {
                return Err(Error::Config(
                    "poll intervals and timeouts must be positive".to_owned(),
                ));
            }

            if poller.interval > MAX_POLL_DURATION || poller.timeout > MAX_POLL_DURATION {
                return Err(Error::Config(format!(
                    "poll intervals and timeouts must not exceed {}s",
                    MAX_POLL_DURATION.as_secs()
                )));
            }
        }

        Ok(())
    }

    pub fn directory_url(&self) -> DirectoryUrl<'_> {
        match (&self.directory_url, self.environment) {
            (Some(url), _) => DirectoryUrl::Other(url),
            (None, Environment::Production) => DirectoryUrl::LetsEncrypt,
            (None, Environment::Staging) => DirectoryUrl::LetsEncryptStaging,
        }
    }
}

fn missing(what: &str, workflow: Workflow) -> Error {
    Error::Config(format!("{what} required for the {workflow} workflow"))
}
