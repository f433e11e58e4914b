use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// A fully qualified domain name a certificate is issued for.
///
/// Always non-empty, lowercase and without the trailing root dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain(String);

impl Domain {
    pub fn new(fqdn: &str) -> Result<Domain> {
        let trimmed = fqdn.trim();
        let name = trimmed.strip_suffix('.').unwrap_or(trimmed);

        if name.is_empty()
            || name.contains(char::is_whitespace)
            || name.contains('/')
            || name.split('.').any(str::is_empty)
        {
            return Err(Error::InvalidDomain(fqdn.to_owned()));
        }

        Ok(Domain(name.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Domain::new(s)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
