//! DNS-01 challenge fulfillment.
//!
//! A challenge is proven by publishing `base64url(sha256(<token>.<thumbprint>))` as a TXT
//! record at `_acme-challenge.<domain>`. The record is provisioned through a [`DnsProvider`],
//! observed through a [`TxtResolver`] until it is visible, and only then reported ready to the
//! ACME provider.
//!
//! Every record provisioned here is owned by a [`ChallengeHandle`] and has to be released with
//! [`ChallengeCoordinator::cleanup`], usually through [`ChallengeCoordinator::scoped`] so the
//! release happens on every exit path of the work that depends on it.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;

use crate::{
    acme::{api, AccountIdentity, AcmeTransport},
    domain::Domain,
    error::{Error, Result},
    poll::Poller,
    resolver::TxtResolver,
};

/// Authoritative DNS hosting the challenge records.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Creates or overwrites the TXT record `name` with `value`, returning the provider's ID
    /// for the record.
    async fn upsert_txt_record(&self, name: &str, value: &str) -> Result<String>;

    async fn delete_record(&self, record_id: &str) -> Result<()>;
}

/// Name of the TXT record holding the DNS-01 proof for `domain`.
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{domain}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    /// Record created at the provider.
    Provisioned,
    /// Record observed through the resolvers.
    Propagated,
    /// ACME provider told to validate.
    Ready,
    /// Record deleted.
    Removed,
}

/// One DNS-01 challenge of an issuance attempt.
#[derive(Debug, Clone)]
pub struct DnsChallenge {
    pub domain: Domain,
    pub token: String,
    pub key_authorization: String,
    pub record_name: String,
    pub record_value: String,
    pub state: ChallengeState,
}

/// Ownership of a provisioned challenge record.
///
/// Dropping a handle without passing it to [`ChallengeCoordinator::cleanup`] leaves the record
/// behind at the provider; this is logged.
pub struct ChallengeHandle {
    challenge: DnsChallenge,
    record_id: String,
    released: bool,
}

impl ChallengeHandle {
    pub fn challenge(&self) -> &DnsChallenge {
        &self.challenge
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }
}

impl fmt::Debug for ChallengeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeHandle")
            .field("record_name", &self.challenge.record_name)
            .field("record_id", &self.record_id)
            .field("state", &self.challenge.state)
            .finish()
    }
}

impl Drop for ChallengeHandle {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "TXT record {} (id {}) was never removed",
                self.challenge.record_name,
                self.record_id
            );
        }
    }
}

/// Drives a single DNS-01 challenge from record creation to removal.
pub struct ChallengeCoordinator {
    acme: Arc<dyn AcmeTransport>,
    dns: Arc<dyn DnsProvider>,
    resolver: Arc<dyn TxtResolver>,
    propagation: Poller,
}

impl ChallengeCoordinator {
    pub fn new(
        acme: Arc<dyn AcmeTransport>,
        dns: Arc<dyn DnsProvider>,
        resolver: Arc<dyn TxtResolver>,
        propagation: Poller,
    ) -> Self {
        ChallengeCoordinator {
            acme,
            dns,
            resolver,
            propagation,
        }
    }

    /// Publishes the proof for `challenge`, waits until it is visible and tells the ACME
    /// provider to validate it.
    ///
    /// If anything after record creation fails, the record is removed before the error is
    /// returned. On success the caller owns the returned handle.
    pub async fn fulfill(
        &self,
        account: &dyn AccountIdentity,
        domain: &Domain,
        challenge: &api::Challenge,
    ) -> Result<ChallengeHandle> {
        let key = account.key();

        let challenge_state = DnsChallenge {
            domain: domain.clone(),
            token: challenge.token.clone(),
            key_authorization: key.key_authorization(&challenge.token)?,
            record_name: challenge_record_name(domain.as_str()),
            record_value: key.dns_proof(&challenge.token)?,
            state: ChallengeState::Provisioned,
        };

        log::info!(
            "Creating TXT record {} for {domain}",
            challenge_state.record_name
        );

        let record_id = self
            .dns
            .upsert_txt_record(&challenge_state.record_name, &challenge_state.record_value)
            .await?;

        log::debug!("TXT record {} has id {record_id}", challenge_state.record_name);

        let mut handle = ChallengeHandle {
            challenge: challenge_state,
            record_id,
            released: false,
        };

        if let Err(err) = self.signal_ready(account, &mut handle, &challenge.url).await {
            self.release(handle).await;
            return Err(err);
        }

        Ok(handle)
    }

    async fn signal_ready(
        &self,
        account: &dyn AccountIdentity,
        handle: &mut ChallengeHandle,
        challenge_url: &str,
    ) -> Result<()> {
        self.wait_for_propagation(&handle.challenge).await?;
        handle.challenge.state = ChallengeState::Propagated;

        log::info!("Notifying ACME provider that {} is ready", challenge_url);
        self.acme
            .notify_challenge_ready(account, challenge_url)
            .await?;
        handle.challenge.state = ChallengeState::Ready;

        Ok(())
    }

    async fn wait_for_propagation(&self, challenge: &DnsChallenge) -> Result<()> {
        let resolver = &*self.resolver;
        let name = challenge.record_name.as_str();
        let expected = challenge.record_value.as_str();

        log::info!(
            "Waiting up to {:?} for {name} to propagate",
            self.propagation.timeout
        );

        let visible = self
            .propagation
            .poll(move || async move {
                match resolver.txt_records(name).await {
                    Ok(values) => {
                        log::trace!("{name} currently resolves to {values:?}");
                        Ok(values.iter().any(|value| value == expected).then_some(()))
                    }
                    Err(err) => {
                        log::debug!("TXT lookup failed, treating {name} as not visible: {err}");
                        Ok(None)
                    }
                }
            })
            .await?;

        match visible {
            Some(()) => {
                log::info!("TXT record {name} is visible");
                Ok(())
            }
            None => Err(Error::PropagationTimeout {
                record: name.to_owned(),
                timeout: self.propagation.timeout,
            }),
        }
    }

    /// Deletes the record owned by `handle`.
    pub async fn cleanup(&self, mut handle: ChallengeHandle) -> Result<()> {
        handle.released = true;

        log::info!("Removing TXT record {}", handle.challenge.record_name);
        self.dns.delete_record(&handle.record_id).await?;
        handle.challenge.state = ChallengeState::Removed;

        Ok(())
    }

    /// Runs `work` while the challenge record exists, then removes the record whatever the
    /// outcome of `work` was.
    ///
    /// The result of `work` is returned unchanged. A failed removal is only logged.
    pub async fn scoped<T, Fut>(&self, handle: ChallengeHandle, work: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let outcome = work.await;
        self.release(handle).await;
        outcome
    }

    async fn release(&self, handle: ChallengeHandle) {
        let record_name = handle.challenge.record_name.clone();

        if let Err(err) = self.cleanup(handle).await {
            log::warn!("Failed to remove TXT record {record_name}: {err}");
        }
    }
}
