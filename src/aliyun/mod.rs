//! Alibaba Cloud RPC style APIs (signature version 1.0).
//!
//! Every call is a form encoded `POST /` carrying the common parameters, the action's own
//! parameters and a `Signature` computed over all of them:
//!
//! ```text
//! StringToSign = "POST" & "%2F" & percent_encode(<sorted, percent encoded query>)
//! Signature    = base64(hmac_sha1("<AccessKeySecret>&", StringToSign))
//! ```

use std::{collections::BTreeMap, time::Duration};

use base64::prelude::*;
use hmac::{Hmac, Mac as _};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{de::DeserializeOwned, Deserialize};
use sha1::Sha1;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    config::Credentials,
    error::{Error, Result},
};

mod cdn;
mod dns;

pub use self::{cdn::AliCdn, dns::AliDns};

type HmacSha1 = Hmac<Sha1>;

/// Everything but the RFC 3986 unreserved characters.
const RPC_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, RPC_ENCODE_SET).to_string()
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

pub(crate) fn string_to_sign(method: &str, params: &BTreeMap<String, String>) -> String {
    format!(
        "{method}&{}&{}",
        encode("/"),
        encode(&canonical_query(params))
    )
}

pub(crate) fn sign(secret: &str, string_to_sign: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(format!("{secret}&").as_bytes())
        .map_err(|err| Error::Crypto(format!("HMAC key: {err}")))?;
    mac.update(string_to_sign.as_bytes());

    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

fn timestamp() -> Result<String> {
    let now = OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
        .map_err(|err| Error::Crypto(format!("timestamp: {err}")))?;

    now.format(&Rfc3339)
        .map_err(|err| Error::Crypto(format!("timestamp: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    code: Option<String>,
    message: Option<String>,
    request_id: Option<String>,
}

/// Signed client for one Alibaba Cloud product endpoint.
#[derive(Debug)]
pub(crate) struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    version: &'static str,
    credentials: Credentials,
}

impl RpcClient {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        version: &'static str,
        credentials: Credentials,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(RpcClient {
            http,
            endpoint: endpoint.into(),
            version,
            credentials,
        })
    }

    fn signed_params(&self, action: &str, params: &[(&str, &str)]) -> Result<BTreeMap<String, String>> {
        let mut query = BTreeMap::new();

        query.insert("Format".to_owned(), "JSON".to_owned());
        query.insert("Version".to_owned(), self.version.to_owned());
        query.insert(
            "AccessKeyId".to_owned(),
            self.credentials.access_key_id.clone(),
        );
        query.insert("SignatureMethod".to_owned(), "HMAC-SHA1".to_owned());
        query.insert("SignatureVersion".to_owned(), "1.0".to_owned());
        query.insert(
            "SignatureNonce".to_owned(),
            uuid::Uuid::new_v4().to_string(),
        );
        query.insert("Timestamp".to_owned(), timestamp()?);
        query.insert("Action".to_owned(), action.to_owned());

        for (key, value) in params {
            query.insert((*key).to_owned(), (*value).to_owned());
        }

        let signature = sign(
            &self.credentials.access_key_secret,
            &string_to_sign("POST", &query),
        )?;
        query.insert("Signature".to_owned(), signature);

        Ok(query)
    }

    /// Calls `action` and deserializes its JSON response.
    pub(crate) async fn call<R: DeserializeOwned>(
        &self,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<R> {
        let body = canonical_query(&self.signed_params(action, params)?);

        log::debug!("Call {action} on {}", self.endpoint);

        let res = self
            .http
            .post(&self.endpoint)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<ErrorResponse>(&text) {
                Ok(err) => format!(
                    "{}: {} (request {})",
                    err.code.as_deref().unwrap_or("Unknown"),
                    err.message.as_deref().unwrap_or_default(),
                    err.request_id.as_deref().unwrap_or("-"),
                ),
                Err(_) => format!("{status} body: {text}"),
            };

            return Err(Error::Transport(format!("{action} failed: {detail}")));
        }

        serde_json::from_str(&text).map_err(|err| Error::transport(&format!("{action} response"), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn common(action: &str, format: &str, version: &str) -> BTreeMap<String, String> {
        params(&[
            ("AccessKeyId", "testid"),
            ("Action", action),
            ("Format", format),
            ("SignatureMethod", "HMAC-SHA1"),
            ("SignatureNonce", "3ee8c1b8-83d3-44af-a94f-4e0ad82fd6cf"),
            ("SignatureVersion", "1.0"),
            ("Timestamp", "2016-02-23T12:46:24Z"),
            ("Version", version),
        ])
    }

    #[test]
    fn test_encode_unreserved_only() {
        assert_eq!(encode("a b*~/+"), "a%20b%2A~%2F%2B");
        assert_eq!(encode("_acme-challenge.example.com"), "_acme-challenge.example.com");
    }

    #[test]
    fn test_documented_signature() {
        // worked example from the Alibaba Cloud signature documentation
        let query = common("DescribeRegions", "XML", "2014-05-26");
        let sts = string_to_sign("GET", &query);

        assert_eq!(
            sts,
            "GET&%2F&AccessKeyId%3Dtestid%26Action%3DDescribeRegions%26Format%3DXML\
             %26SignatureMethod%3DHMAC-SHA1\
             %26SignatureNonce%3D3ee8c1b8-83d3-44af-a94f-4e0ad82fd6cf\
             %26SignatureVersion%3D1.0%26Timestamp%3D2016-02-23T12%253A46%253A24Z\
             %26Version%3D2014-05-26"
        );
        assert_eq!(sign("testsecret", &sts).unwrap(), "OLeaidS1JvxuMvnyHOwuJ+uX5qY=");
    }

    #[test]
    fn test_post_signature() {
        let mut query = common("DescribeDomains", "JSON", "2015-01-09");
        query.insert("PageSize".to_owned(), "100".to_owned());

        let sts = string_to_sign("POST", &query);
        assert!(sts.starts_with("POST&%2F&AccessKeyId%3Dtestid%26Action%3DDescribeDomains"));
        assert!(sts.contains("%26PageSize%3D100%26"));

        let signature = sign("testsecret", &sts).unwrap();
        assert_eq!(signature, "rxI+E6rI4BQrvSuNpUW+BsXgVfE=");
        assert_eq!(signature.len(), 28);
    }

    #[test]
    fn test_signed_params() {
        let client = RpcClient::new(
            "https://alidns.aliyuncs.com/",
            "2015-01-09",
            Credentials::new("testid", "testsecret"),
        )
        .unwrap();

        let query = client
            .signed_params("DeleteDomainRecord", &[("RecordId", "9999985")])
            .unwrap();

        assert_eq!(query["Action"], "DeleteDomainRecord");
        assert_eq!(query["RecordId"], "9999985");
        assert_eq!(query["Version"], "2015-01-09");
        assert!(query["Timestamp"].ends_with('Z'));
        assert!(!query["Timestamp"].contains('.'));

        let mut unsigned = query.clone();
        let signature = unsigned.remove("Signature").unwrap();
        assert_eq!(
            signature,
            sign("testsecret", &string_to_sign("POST", &unsigned)).unwrap()
        );
    }
}
