use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use base64::prelude::*;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    acme::{
        api,
        jws::{self, ProtectedHeader},
        AccountIdentity, AcmeKey, AcmeTransport, PlacedOrder, Registration,
    },
    error::{Error, Result},
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Attempts per request when the provider rejects our nonce.
const MAX_NONCE_ATTEMPTS: usize = 3;

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Key reference placed in the JWS protected header.
enum Signer<'a> {
    Jwk(&'a AcmeKey),
    Kid(&'a dyn AccountIdentity),
}

impl Signer<'_> {
    fn sign<T: Serialize + ?Sized>(&self, url: &str, nonce: String, payload: &T) -> Result<String> {
        match self {
            Signer::Jwk(key) => {
                let header = ProtectedHeader::with_jwk(key.jwk()?, url, nonce);
                jws::sign(&header, key, payload)
            }
            Signer::Kid(account) => {
                let header = ProtectedHeader::with_kid(account.registration_uri(), url, nonce);
                jws::sign(&header, account.key(), payload)
            }
        }
    }
}

/// [`AcmeTransport`] over HTTPS.
///
/// Every request is a JWS signed POST. Nonces handed out by the provider are pooled and reused
/// for the next request; a `badNonce` rejection is retried with a fresh nonce.
#[derive(Debug)]
pub struct HttpAcme {
    http: reqwest::Client,
    directory: api::Directory,
    nonces: Mutex<VecDeque<String>>,
}

impl HttpAcme {
    /// Fetches the directory at `url` and prepares a client for it.
    pub async fn connect(url: DirectoryUrl<'_>) -> Result<HttpAcme> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()?;

        let url = url.to_url();
        log::debug!("Fetching ACME directory {url}");

        let res = handle_problem(http.get(url).send().await?).await?;
        let directory = res.json::<api::Directory>().await?;

        Ok(HttpAcme {
            http,
            directory,
            nonces: Mutex::new(VecDeque::new()),
        })
    }

    pub fn directory(&self) -> &api::Directory {
        &self.directory
    }

    fn stash_nonce(&self, res: &reqwest::Response) {
        let Some(nonce) = res
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        log::trace!("Extracting new nonce");

        let mut pool = self.nonces.lock();
        pool.push_back(nonce.to_owned());
        if pool.len() > 10 {
            pool.pop_front();
        }
    }

    async fn nonce(&self) -> Result<String> {
        let pooled = self.nonces.lock().pop_front();
        if let Some(nonce) = pooled {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = self.http.head(&self.directory.new_nonce).send().await?;
        expect_header(&res, "replay-nonce")
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        signer: Signer<'_>,
        payload: &T,
    ) -> Result<reqwest::Response> {
        let mut attempt = 1;

        loop {
            let nonce = self.nonce().await?;
            let body = signer.sign(url, nonce, payload)?;

            log::debug!("Call endpoint: {url}");

            let res = self
                .http
                .post(url)
                .header("content-type", "application/jose+json")
                .body(body)
                .send()
                .await?;

            self.stash_nonce(&res);

            match handle_problem(res).await {
                Err(Error::Acme(problem))
                    if problem.is_bad_nonce() && attempt < MAX_NONCE_ATTEMPTS =>
                {
                    log::debug!("Retrying on bad nonce");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn post_as_get<R: DeserializeOwned>(
        &self,
        account: &dyn AccountIdentity,
        url: &str,
    ) -> Result<R> {
        let res = self
            .post(url, Signer::Kid(account), &api::EmptyString)
            .await?;
        Ok(res.json::<R>().await?)
    }
}

#[async_trait]
impl AcmeTransport for HttpAcme {
    async fn create_account(&self, key: &AcmeKey, contact: &[String]) -> Result<Registration> {
        let payload = api::Account {
            contact: (!contact.is_empty()).then(|| contact.to_vec()),
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let res = self
            .post(&self.directory.new_account, Signer::Jwk(key), &payload)
            .await?;

        let uri = expect_header(&res, "location")?;
        log::debug!("Key ID is: {uri}");

        let account = res.json::<api::Account>().await?;

        Ok(Registration { uri, account })
    }

    async fn create_order(
        &self,
        account: &dyn AccountIdentity,
        domain: &str,
    ) -> Result<PlacedOrder> {
        let payload = api::Order::for_domain(domain);

        let res = self
            .post(&self.directory.new_order, Signer::Kid(account), &payload)
            .await?;

        let url = expect_header(&res, "location")?;
        let order = res.json::<api::Order>().await?;

        Ok(PlacedOrder { url, order })
    }

    async fn get_authorization(
        &self,
        account: &dyn AccountIdentity,
        url: &str,
    ) -> Result<api::Authorization> {
        self.post_as_get(account, url).await
    }

    async fn notify_challenge_ready(
        &self,
        account: &dyn AccountIdentity,
        challenge_url: &str,
    ) -> Result<()> {
        let res = self
            .post(challenge_url, Signer::Kid(account), &api::EmptyObject)
            .await?;

        let challenge = res.json::<api::Challenge>().await?;
        log::debug!("Challenge {challenge_url} is {:?}", challenge.status);

        Ok(())
    }

    async fn poll_order(
        &self,
        account: &dyn AccountIdentity,
        order_url: &str,
    ) -> Result<api::Order> {
        self.post_as_get(account, order_url).await
    }

    async fn finalize_order(
        &self,
        account: &dyn AccountIdentity,
        finalize_url: &str,
        csr_der: &[u8],
    ) -> Result<api::Order> {
        let payload = api::Finalize {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };

        let res = self
            .post(finalize_url, Signer::Kid(account), &payload)
            .await?;

        Ok(res.json::<api::Order>().await?)
    }

    async fn download_certificate(
        &self,
        account: &dyn AccountIdentity,
        certificate_url: &str,
    ) -> Result<String> {
        let res = self
            .post(certificate_url, Signer::Kid(account), &api::EmptyString)
            .await?;

        Ok(res.text().await?)
    }
}

/// Passes successful responses through and turns everything else into a [`api::Problem`].
async fn handle_problem(res: reqwest::Response) -> Result<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }

    let status = res.status();
    let is_problem_json = res
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    // the provider sometimes closes the connection abruptly after sending the body
    let body = res.text().await.unwrap_or_default();

    let problem = if is_problem_json {
        serde_json::from_str(&body).unwrap_or_else(|err| api::Problem {
            _type: "problemJsonFail".to_owned(),
            detail: Some(format!(
                "Failed to deserialize application/problem+json ({err}) body: {body}"
            )),
            subproblems: None,
        })
    } else {
        api::Problem {
            _type: "httpReqError".to_owned(),
            detail: Some(format!("{status} body: {body}")),
            subproblems: None,
        }
    };

    Err(Error::Acme(problem))
}

fn expect_header(res: &reqwest::Response, name: &str) -> Result<String> {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| Error::Transport(format!("missing {name} header from {}", res.url())))
}
