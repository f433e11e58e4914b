//! ACME (RFC 8555) capability used by the issuance pipeline.
//!
//! The pipeline only talks to an ACME provider through [`AcmeTransport`], so it can be driven
//! against [`HttpAcme`] in production and an in-memory double in tests. Requests made on behalf
//! of a registered account are signed with the key exposed by [`AccountIdentity`].

use async_trait::async_trait;

use crate::error::Result;

pub mod api;
mod client;
mod jws;
mod key;

pub use self::{
    client::{DirectoryUrl, HttpAcme},
    key::{create_p256_key, AcmeKey},
};

/// Account data needed to sign requests with a registered account.
pub trait AccountIdentity: Send + Sync {
    /// Contact email the account was registered with.
    fn email(&self) -> &str;

    /// Account URL returned by the provider. Used as the JWS key ID.
    fn registration_uri(&self) -> &str;

    /// Key pair the account was registered with.
    fn key(&self) -> &AcmeKey;
}

/// Result of a `newAccount` request.
#[derive(Debug, Clone)]
pub struct Registration {
    pub uri: String,
    pub account: api::Account,
}

/// An order as returned by `newOrder`, together with its URL.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub url: String,
    pub order: api::Order,
}

/// Operations the pipeline needs from an ACME provider.
#[async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Registers `key` with the provider, agreeing to the terms of service.
    async fn create_account(&self, key: &AcmeKey, contact: &[String]) -> Result<Registration>;

    /// Places a new order for a single DNS identifier.
    async fn create_order(&self, account: &dyn AccountIdentity, domain: &str)
        -> Result<PlacedOrder>;

    async fn get_authorization(
        &self,
        account: &dyn AccountIdentity,
        url: &str,
    ) -> Result<api::Authorization>;

    /// Tells the provider the challenge proof is in place and may be validated.
    async fn notify_challenge_ready(
        &self,
        account: &dyn AccountIdentity,
        challenge_url: &str,
    ) -> Result<()>;

    async fn poll_order(&self, account: &dyn AccountIdentity, order_url: &str)
        -> Result<api::Order>;

    /// Submits a DER encoded CSR to the order's finalize URL.
    async fn finalize_order(
        &self,
        account: &dyn AccountIdentity,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<api::Order>;

    /// Downloads the issued certificate chain as PEM.
    async fn download_certificate(
        &self,
        account: &dyn AccountIdentity,
        certificate_url: &str,
    ) -> Result<String>;
}
