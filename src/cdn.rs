//! Deployment of stored certificates to the CDN edge.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::{
    domain::Domain,
    error::{Error, Result},
};

/// Acknowledgement of an accepted certificate update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub request_id: String,
}

/// Remote side of certificate deployment.
#[async_trait]
pub trait CdnTransport: Send + Sync {
    /// Uploads `certificate_pem` and `private_key_pem` for `domain` and switches HTTPS on with
    /// them, in one request.
    async fn set_certificate(
        &self,
        domain: &str,
        region: &str,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<Ack>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    On,
    Off,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertificateStatus::On => "on",
            CertificateStatus::Off => "off",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate configuration of a CDN domain after a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnCertificateBinding {
    pub domain: Domain,
    pub region: String,
    pub status: CertificateStatus,
    /// Local certificate file the binding was created from.
    pub certificate_ref: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentResult {
    pub binding: CdnCertificateBinding,
    /// Request ID reported by the CDN, for support inquiries.
    pub request_id: String,
}

/// Uploads certificates to one CDN account and region.
pub struct CdnDeployer {
    transport: Arc<dyn CdnTransport>,
    region: String,
}

impl CdnDeployer {
    pub fn new(transport: Arc<dyn CdnTransport>, region: impl Into<String>) -> Self {
        CdnDeployer {
            transport,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Deploys the certificate at `cert_path` with the key at `key_path` for `domain`.
    ///
    /// Both files are checked before the CDN is contacted. Failures of the CDN request are
    /// reported as [`Error::Deployment`] and not retried.
    pub async fn deploy(
        &self,
        domain: &Domain,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<DeploymentResult> {
        ensure_artifact(cert_path)?;
        ensure_artifact(key_path)?;

        let certificate = fs::read_to_string(cert_path).map_err(|err| Error::io(cert_path, err))?;
        let private_key = Zeroizing::new(
            fs::read_to_string(key_path).map_err(|err| Error::io(key_path, err))?,
        );

        log::info!(
            "Uploading certificate for {domain} to the CDN ({})",
            self.region
        );

        let ack = self
            .transport
            .set_certificate(domain.as_str(), &self.region, &certificate, &private_key)
            .await
            .map_err(|err| Error::Deployment {
                domain: domain.to_string(),
                source: Box::new(err),
            })?;

        log::info!(
            "Certificate for {domain} is active (request {})",
            ack.request_id
        );

        Ok(DeploymentResult {
            binding: CdnCertificateBinding {
                domain: domain.clone(),
                region: self.region.clone(),
                status: CertificateStatus::On,
                certificate_ref: cert_path.to_owned(),
            },
            request_id: ack.request_id,
        })
    }
}

pub(crate) fn ensure_artifact(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::MissingArtifact {
            path: path.to_owned(),
        })
    }
}
