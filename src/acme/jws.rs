//! Flattened JWS request bodies, see [RFC 8555 §6.2].
//!
//! [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2

use base64::prelude::*;
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::{Deserialize, Serialize};

use crate::{
    acme::AcmeKey,
    error::{Error, Result},
};

/// Protected header. `newAccount` carries the full `jwk`; every later request carries the
/// account URL as `kid`.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct ProtectedHeader {
    alg: String,
    nonce: String,
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl ProtectedHeader {
    pub(crate) fn with_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn with_kid(kid: &str, url: &str, nonce: String) -> Self {
        ProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl TryFrom<&AcmeKey> for Jwk {
    type Error = Error;

    fn try_from(key: &AcmeKey) -> Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(Error::Crypto("public key has no affine coordinates".to_owned()));
        };

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Required members of an EC JWK in lexical order, as hashed for the thumbprint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(jwk: &Jwk) -> Self {
        JwkThumb {
            crv: jwk.crv.clone(),
            kty: jwk.kty.clone(),
            x: jwk.x.clone(),
            y: jwk.y.clone(),
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Signs `payload` under `protected` and serializes the flattened JWS.
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: &ProtectedHeader,
    key: &AcmeKey,
    payload: &T,
) -> Result<String> {
    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(protected)?);

    let payload_json = serde_json::to_string(payload)?;

    // POST-as-GET requests carry an empty payload, not an encoded `""`.
    let payload = if payload_json == "\"\"" {
        String::new()
    } else {
        BASE64_URL_SAFE_NO_PAD.encode(payload_json)
    };

    let signature: Signature = key
        .signing_key()
        .sign(format!("{protected}.{payload}").as_bytes());

    let jws = FlattenedJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::signature::Verifier as _;

    use super::*;
    use crate::acme::api;

    fn decode(part: &str) -> Vec<u8> {
        BASE64_URL_SAFE_NO_PAD.decode(part).unwrap()
    }

    #[test]
    fn test_signature_verifies() {
        let key = AcmeKey::generate();
        let header = ProtectedHeader::with_kid(
            "https://example.com/acme/acct/1",
            "https://example.com/acme/new-order",
            "nonce".to_owned(),
        );

        let body = sign(&header, &key, &api::Order::for_domain("example.com")).unwrap();
        let jws: FlattenedJws = serde_json::from_str(&body).unwrap();

        let signature = Signature::from_slice(&decode(&jws.signature)).unwrap();
        let signed = format!("{}.{}", jws.protected, jws.payload);
        key.signing_key()
            .verifying_key()
            .verify(signed.as_bytes(), &signature)
            .unwrap();

        let protected: serde_json::Value =
            serde_json::from_slice(&decode(&jws.protected)).unwrap();
        assert_eq!(protected["kid"], "https://example.com/acme/acct/1");
        assert!(protected.get("jwk").is_none());
    }

    #[test]
    fn test_post_as_get_has_empty_payload() {
        let key = AcmeKey::generate();
        let header = ProtectedHeader::with_jwk(
            Jwk::try_from(&key).unwrap(),
            "https://example.com/acme/new-acct",
            "nonce".to_owned(),
        );

        let body = sign(&header, &key, &api::EmptyString).unwrap();
        let jws: FlattenedJws = serde_json::from_str(&body).unwrap();
        assert_eq!(jws.payload, "");
    }
}
