use std::sync::Arc;

use der::{asn1::Ia5String, Encode as _};
use parking_lot::Mutex;
use pkcs8::EncodePrivateKey as _;
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};

use crate::{
    acme::{
        api::{self, AuthorizationStatus, OrderStatus},
        create_p256_key, AccountIdentity, AcmeTransport,
    },
    challenge::ChallengeCoordinator,
    domain::Domain,
    error::{Error, Result},
    poll::Poller,
    store::CertificateBundle,
};

/// Creates a CSR for `domain` and signs it with `signer`.
///
/// The domain is used both as the Common Name (CN) and as the only Subject Alternative Name.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    domain: &Domain,
) -> Result<x509_cert::request::CertReq> {
    let subject = format!("CN={domain}")
        .parse::<Name>()
        .map_err(|err| Error::Crypto(format!("CSR subject: {err}")))?;

    let mut csr = CsrBuilder::new(subject, signer)
        .map_err(|err| Error::Crypto(format!("CSR builder: {err}")))?;

    let san = Ia5String::new(domain.as_str())?;
    csr.add_extension(&SubjectAltName(vec![GeneralName::DnsName(san)]))
        .map_err(|err| Error::Crypto(format!("CSR extension: {err}")))?;

    csr.build::<p256::ecdsa::DerSignature>()
        .map_err(|err| Error::Crypto(format!("build CSR: {err}")))
}

/// Drives one ACME order for a single domain to a certificate.
///
/// An order moves `pending → ready → processing → valid` once its DNS-01 authorization has been
/// validated, or ends up `invalid` when the provider rejects the challenge. Waiting for the
/// order happens while the challenge record is still published; the record is removed as soon
/// as the order leaves the pending state, whatever the result.
pub struct CertificateIssuer {
    acme: Arc<dyn AcmeTransport>,
    challenges: ChallengeCoordinator,
    order_poller: Poller,
}

impl CertificateIssuer {
    pub fn new(
        acme: Arc<dyn AcmeTransport>,
        challenges: ChallengeCoordinator,
        order_poller: Poller,
    ) -> Self {
        CertificateIssuer {
            acme,
            challenges,
            order_poller,
        }
    }

    pub async fn issue(
        &self,
        account: &dyn AccountIdentity,
        domain: &Domain,
    ) -> Result<CertificateBundle> {
        log::info!("Placing order for {domain}");

        let placed = self.acme.create_order(account, domain.as_str()).await?;
        let order_url = placed.url.as_str();

        if !placed.order.covers(domain.as_str()) {
            return Err(Error::ChallengeValidation {
                domain: domain.to_string(),
                reason: format!("order {order_url} does not include {domain}"),
            });
        }

        let Some(auth_url) = placed.order.authorizations.first() else {
            return Err(Error::ChallengeValidation {
                domain: domain.to_string(),
                reason: format!("order {order_url} has no authorizations"),
            });
        };

        let auth = self.acme.get_authorization(account, auth_url).await?;

        let order = match auth.status {
            AuthorizationStatus::Valid => {
                log::info!("Authorization for {domain} is already valid");
                self.await_order(account, order_url).await?
            }

            AuthorizationStatus::Pending => {
                let Some(challenge) = auth.dns_challenge() else {
                    return Err(Error::ChallengeValidation {
                        domain: domain.to_string(),
                        reason: "no dns-01 challenge offered".to_owned(),
                    });
                };

                let handle = self.challenges.fulfill(account, domain, challenge).await?;
                self.challenges
                    .scoped(handle, self.await_order(account, order_url))
                    .await?
            }

            status => {
                return Err(Error::ChallengeValidation {
                    domain: domain.to_string(),
                    reason: format!("authorization is {status:?}"),
                });
            }
        };

        self.complete(account, domain, order_url, auth_url, order)
            .await
    }

    /// Takes an order that left the pending state to a downloaded certificate.
    async fn complete(
        &self,
        account: &dyn AccountIdentity,
        domain: &Domain,
        order_url: &str,
        auth_url: &str,
        mut order: api::Order,
    ) -> Result<CertificateBundle> {
        let mut private_key = None;

        loop {
            match order.status {
                Some(OrderStatus::Ready) if private_key.is_none() => {
                    log::info!("Finalizing order for {domain}");

                    let signer = create_p256_key();
                    let csr = create_csr(&signer, domain)?.to_der()?;

                    order = self
                        .acme
                        .finalize_order(account, &order.finalize, &csr)
                        .await?;
                    private_key = Some(signer);
                }

                Some(OrderStatus::Valid) => {
                    let (Some(certificate_url), Some(signer)) =
                        (order.certificate.as_deref(), private_key.as_ref())
                    else {
                        return Err(Error::OrderState {
                            url: order_url.to_owned(),
                            status: order.status,
                        });
                    };

                    log::info!("Downloading certificate for {domain}");

                    let certificate_pem = self
                        .acme
                        .download_certificate(account, certificate_url)
                        .await?;
                    let private_key_pem = signer.to_pkcs8_pem(pem::LineEnding::LF)?;

                    return Ok(CertificateBundle::new(
                        domain.clone(),
                        certificate_pem,
                        private_key_pem,
                    ));
                }

                Some(OrderStatus::Processing) => {
                    order = self.await_order(account, order_url).await?;
                }

                Some(OrderStatus::Invalid) => {
                    let reason = self.rejection_reason(account, auth_url, &order).await;
                    return Err(Error::ChallengeValidation {
                        domain: domain.to_string(),
                        reason,
                    });
                }

                status => {
                    return Err(Error::OrderState {
                        url: order_url.to_owned(),
                        status,
                    });
                }
            }
        }
    }

    /// Polls the order until it leaves `pending`/`processing`.
    async fn await_order(&self, account: &dyn AccountIdentity, order_url: &str) -> Result<api::Order> {
        let acme = &*self.acme;
        let last_status = &Mutex::new(None);

        let settled = self
            .order_poller
            .poll(move || async move {
                let order = acme.poll_order(account, order_url).await?;
                log::debug!("Order {order_url} is {:?}", order.status);

                *last_status.lock() = order.status;

                Ok(match order.status {
                    Some(OrderStatus::Pending | OrderStatus::Processing) => None,
                    _ => Some(order),
                })
            })
            .await?;

        settled.ok_or_else(|| Error::OrderTimeout {
            url: order_url.to_owned(),
            status: *last_status.lock(),
            timeout: self.order_poller.timeout,
        })
    }

    async fn rejection_reason(
        &self,
        account: &dyn AccountIdentity,
        auth_url: &str,
        order: &api::Order,
    ) -> String {
        if let Some(problem) = &order.error {
            return problem.to_string();
        }

        match self.acme.get_authorization(account, auth_url).await {
            Ok(auth) => match auth.challenge_error() {
                Some(problem) => problem.to_string(),
                None => format!("authorization is {:?}", auth.status),
            },
            Err(err) => {
                log::debug!("Could not fetch authorization {auth_url}: {err}");
                "order became invalid".to_owned()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use der::{Decode as _, DecodePem as _};

    use super::*;
    use crate::test::{test_account, MockAcme, MockDns, OrderOutcome};

    fn fast() -> Poller {
        Poller::new(Duration::from_millis(1), Duration::from_millis(30))
    }

    fn issuer(acme: &Arc<MockAcme>, dns: &Arc<MockDns>) -> CertificateIssuer {
        let challenges = ChallengeCoordinator::new(acme.clone(), dns.clone(), dns.clone(), fast());
        CertificateIssuer::new(acme.clone(), challenges, fast())
    }

    #[test]
    fn test_csr_names_domain() {
        let key = create_p256_key();
        let domain = Domain::new("cdn.example.com").unwrap();

        let csr = create_csr(&key, &domain).unwrap();
        assert_eq!(csr.info.subject.to_string(), "CN=cdn.example.com");
        assert_eq!(csr.info.attributes.len(), 1);
    }

    #[tokio::test]
    async fn test_issue_returns_certificate_for_domain() {
        let acme = Arc::new(MockAcme::default());
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        let bundle = issuer(&acme, &dns).issue(&account, &domain).await.unwrap();

        assert_eq!(bundle.domain(), &domain);
        assert_eq!(bundle.common_name().unwrap().as_deref(), Some("example.com"));
        assert!(bundle.private_key().contains("BEGIN PRIVATE KEY"));
        assert_eq!(acme.calls("finalize_order"), 1);
        assert_eq!(dns.deletes().len(), 1);

        let csr = x509_cert::request::CertReq::from_der(&acme.csrs()[0]);
        assert!(csr.is_ok());
        assert!(x509_cert::Certificate::from_pem(bundle.certificate()).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_order_reports_reason_and_removes_record() {
        let acme = Arc::new(MockAcme {
            outcome: OrderOutcome::Invalid,
            ..Default::default()
        });
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        let err = issuer(&acme, &dns)
            .issue(&account, &domain)
            .await
            .unwrap_err();

        assert!(
            matches!(err, Error::ChallengeValidation { ref reason, .. } if reason.contains("Incorrect TXT record"))
        );
        assert_eq!(dns.deletes().len(), 1);
        assert_eq!(acme.calls("finalize_order"), 0);
    }

    #[tokio::test]
    async fn test_stuck_order_times_out_and_removes_record() {
        let acme = Arc::new(MockAcme {
            outcome: OrderOutcome::Stuck,
            ..Default::default()
        });
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        let err = issuer(&acme, &dns)
            .issue(&account, &domain)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::OrderTimeout {
                status: Some(OrderStatus::Pending),
                ..
            }
        ));
        assert_eq!(dns.deletes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_readiness_signal_removes_record() {
        let acme = Arc::new(MockAcme {
            fail_notify: true,
            ..Default::default()
        });
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        let err = issuer(&acme, &dns)
            .issue(&account, &domain)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(dns.upserts().len(), 1);
        assert_eq!(dns.deletes().len(), 1);
        assert_eq!(acme.calls("poll_order"), 0);
    }

    #[tokio::test]
    async fn test_failed_order_poll_removes_record() {
        let acme = Arc::new(MockAcme {
            fail_poll: true,
            ..Default::default()
        });
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        let err = issuer(&acme, &dns)
            .issue(&account, &domain)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(acme.calls("notify_challenge_ready"), 1);
        assert_eq!(acme.calls("poll_order"), 1);
        assert_eq!(dns.deletes().len(), 1);
        assert_eq!(acme.calls("finalize_order"), 0);
    }

    #[tokio::test]
    async fn test_valid_authorization_skips_challenge() {
        let acme = Arc::new(MockAcme {
            authorization_status: AuthorizationStatus::Valid,
            ..Default::default()
        });
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        issuer(&acme, &dns).issue(&account, &domain).await.unwrap();

        assert!(dns.upserts().is_empty());
        assert_eq!(acme.calls("notify_challenge_ready"), 0);
    }

    #[tokio::test]
    async fn test_missing_dns_challenge() {
        let acme = Arc::new(MockAcme {
            offer_dns_challenge: false,
            ..Default::default()
        });
        let dns = Arc::new(MockDns::default());
        let account = test_account(acme.clone()).await;
        let domain = Domain::new("example.com").unwrap();

        let err = issuer(&acme, &dns)
            .issue(&account, &domain)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ChallengeValidation { .. }));
        assert!(dns.upserts().is_empty());
    }
}
