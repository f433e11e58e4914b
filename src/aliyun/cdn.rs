use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    aliyun::RpcClient,
    cdn::{Ack, CdnTransport, CertificateStatus},
    config::Credentials,
    error::Result,
};

const ENDPOINT: &str = "https://cdn.aliyuncs.com/";
const VERSION: &str = "2018-05-10";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SetDomainServerCertificateResponse {
    request_id: String,
}

/// [`CdnTransport`] backed by Alibaba Cloud CDN.
///
/// Uses `SetDomainServerCertificate`, which uploads the certificate and enables HTTPS with it
/// in the same call.
#[derive(Debug)]
pub struct AliCdn {
    rpc: RpcClient,
}

impl AliCdn {
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::with_endpoint(ENDPOINT, credentials)
    }

    pub fn with_endpoint(endpoint: &str, credentials: Credentials) -> Result<Self> {
        Ok(AliCdn {
            rpc: RpcClient::new(endpoint, VERSION, credentials)?,
        })
    }
}

#[async_trait]
impl CdnTransport for AliCdn {
    async fn set_certificate(
        &self,
        domain: &str,
        region: &str,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<Ack> {
        let res: SetDomainServerCertificateResponse = self
            .rpc
            .call(
                "SetDomainServerCertificate",
                &[
                    ("DomainName", domain),
                    ("RegionId", region),
                    ("CertType", "upload"),
                    ("ServerCertificateStatus", CertificateStatus::On.as_str()),
                    ("ServerCertificate", certificate_pem),
                    ("PrivateKey", private_key_pem),
                ],
            )
            .await?;

        Ok(Ack {
            request_id: res.request_id,
        })
    }
}
