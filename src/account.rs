use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    acme::{AccountIdentity, AcmeKey, AcmeTransport},
    error::{Error, Result},
};

/// Account registered with an ACME provider.
///
/// Consists of the contact email address, the P-256 key pair requests are signed with and the
/// account URL the provider assigned at registration.
#[derive(Debug, Clone)]
pub struct AcmeAccount {
    email: String,
    key: AcmeKey,
    registration_uri: String,
    terms_accepted: bool,
}

impl AcmeAccount {
    pub fn terms_accepted(&self) -> bool {
        self.terms_accepted
    }
}

impl AccountIdentity for AcmeAccount {
    fn email(&self) -> &str {
        &self.email
    }

    fn registration_uri(&self) -> &str {
        &self.registration_uri
    }

    fn key(&self) -> &AcmeKey {
        &self.key
    }
}

/// Owns the single ACME account of a run.
///
/// The key pair is generated in memory and never persisted, so every process run registers a
/// fresh account.
pub struct AccountManager {
    acme: Arc<dyn AcmeTransport>,
    account: Mutex<Option<AcmeAccount>>,
}

impl AccountManager {
    pub fn new(acme: Arc<dyn AcmeTransport>) -> Self {
        AccountManager {
            acme,
            account: Mutex::new(None),
        }
    }

    /// Returns the run's account, registering it on first use.
    ///
    /// A run has exactly one account: asking for a different email once an account exists is a
    /// [`Error::Config`] error.
    ///
    /// Registration always agrees to the provider's terms of service. Rejections (malformed
    /// contact, rate limits) are reported as [`Error::Registration`] and not retried.
    pub async fn ensure_account(&self, email: &str) -> Result<AcmeAccount> {
        let email = email.trim();

        let cached = self.account.lock().clone();
        if let Some(account) = cached {
            if account.email != email {
                return Err(Error::Config(format!(
                    "ACME account already registered for {}, refusing to register {email}",
                    account.email
                )));
            }

            log::debug!("Reusing ACME account {}", account.registration_uri);
            return Ok(account);
        }

        if email.is_empty() {
            return Err(Error::Config("contact email must not be empty".to_owned()));
        }

        log::info!("Registering ACME account for {email}");

        let key = AcmeKey::generate();
        let contact = [format!("mailto:{email}")];

        let registration = self
            .acme
            .create_account(&key, &contact)
            .await
            .map_err(|err| Error::Registration {
                email: email.to_owned(),
                source: Box::new(err),
            })?;

        let account = AcmeAccount {
            email: email.to_owned(),
            key,
            registration_uri: registration.uri,
            terms_accepted: registration.account.terms_of_service_agreed.unwrap_or(true),
        };

        log::info!("Registered ACME account {}", account.registration_uri);

        *self.account.lock() = Some(account.clone());
        Ok(account)
    }
}
