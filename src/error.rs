use std::{fmt, io, path::PathBuf, time::Duration};

use crate::acme::api::{OrderStatus, Problem};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while issuing, storing or deploying a certificate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ACME account registration for {email:?} failed")]
    Registration {
        email: String,
        #[source]
        source: Box<Error>,
    },

    #[error("TXT record {record} was not visible through the resolvers after {timeout:?}")]
    PropagationTimeout { record: String, timeout: Duration },

    #[error("challenge validation for {domain} failed: {reason}")]
    ChallengeValidation { domain: String, reason: String },

    #[error("order {url} did not leave the {status:?} state within {timeout:?}")]
    OrderTimeout {
        url: String,
        status: Option<OrderStatus>,
        timeout: Duration,
    },

    #[error("order {url} is in unexpected state {status:?}")]
    OrderState {
        url: String,
        status: Option<OrderStatus>,
    },

    #[error("certificate bundle for {domain} is incomplete: {path} is missing or empty")]
    IncompleteBundle { domain: String, path: PathBuf },

    #[error("no certificate bundle stored for {domain}")]
    NotFound { domain: String },

    #[error("certificate artifact {path} does not exist")]
    MissingArtifact { path: PathBuf },

    #[error("deploying certificate for {domain} to the CDN failed")]
    Deployment {
        domain: String,
        #[source]
        source: Box<Error>,
    },

    #[error("ACME server problem: {0}")]
    Acme(Problem),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid domain {0:?}")]
    InvalidDomain(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("crypto error: {0}")]
    Crypto(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn transport(context: &str, err: impl fmt::Display) -> Self {
        Error::Transport(format!("{context}: {err}"))
    }
}

impl From<Problem> for Error {
    fn from(problem: Problem) -> Self {
        Error::Acme(problem)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::transport("malformed JSON payload", err)
    }
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

impl From<pkcs8::Error> for Error {
    fn from(err: pkcs8::Error) -> Self {
        Error::Crypto(err.to_string())
    }
}

/// The workflow stage a [`WorkflowError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Account,
    Issuance,
    Storage,
    Deployment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Setup => "setup",
            Stage::Account => "account registration",
            Stage::Issuance => "certificate issuance",
            Stage::Storage => "certificate storage",
            Stage::Deployment => "CDN deployment",
        })
    }
}

/// A stage failure that aborted an [`Orchestrator`] workflow.
///
/// The stage's own error is kept untouched as the source.
///
/// [`Orchestrator`]: crate::Orchestrator
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed")]
pub struct WorkflowError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl WorkflowError {
    pub(crate) fn new(stage: Stage, source: Error) -> Self {
        WorkflowError { stage, source }
    }

    /// Returns the error raised by the failing stage.
    pub fn error(&self) -> &Error {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_converts_into_acme_error() {
        let problem = Problem {
            _type: "urn:ietf:params:acme:error:rateLimited".to_owned(),
            detail: Some("too many registrations".to_owned()),
            subproblems: None,
        };

        let err = Error::from(problem);
        assert!(matches!(err, Error::Acme(_)));
        assert!(err.to_string().contains("too many registrations"));
    }

    #[test]
    fn test_workflow_error_names_stage() {
        let err = WorkflowError::new(
            Stage::Issuance,
            Error::PropagationTimeout {
                record: "_acme-challenge.example.com".to_owned(),
                timeout: Duration::from_secs(60),
            },
        );

        assert_eq!(err.to_string(), "certificate issuance stage failed");
        assert!(matches!(err.error(), Error::PropagationTimeout { .. }));

        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("_acme-challenge.example.com"));
    }
}
