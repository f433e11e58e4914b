use base64::prelude::*;
use pkcs8::EncodePrivateKey as _;
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

use crate::{
    acme::jws::{Jwk, JwkThumb},
    error::Result,
};

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Elliptic curve P-256 key pair an ACME account is registered with.
#[derive(Clone)]
pub struct AcmeKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl AcmeKey {
    /// Generates a fresh key pair.
    pub fn generate() -> AcmeKey {
        AcmeKey {
            signing_key: create_p256_key(),
        }
    }

    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        Ok(self.signing_key.to_pkcs8_pem(pem::LineEnding::LF)?)
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }

    pub(crate) fn jwk(&self) -> Result<Jwk> {
        Jwk::try_from(self)
    }

    /// JWK thumbprint of the public key ([RFC 7638]), base64url encoded.
    ///
    /// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = self.jwk()?;
        let thumb_json = serde_json::to_string(&JwkThumb::from(&jwk))?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(thumb_json)))
    }

    /// Key authorization for a challenge token: `<token>.<thumbprint>`.
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        Ok(format!("{token}.{}", self.thumbprint()?))
    }

    /// Value of the `_acme-challenge` TXT record for a DNS-01 challenge token.
    ///
    /// See [RFC 8555 §8.4](https://datatracker.ietf.org/doc/html/rfc8555#section-8.4).
    pub fn dns_proof(&self, token: &str) -> Result<String> {
        let key_auth = self.key_authorization(token)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth)))
    }
}

impl std::fmt::Debug for AcmeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeKey").finish_non_exhaustive()
    }
}
