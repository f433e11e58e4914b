//! Issuing certificates from ACME (Automatic Certificate Management Environment) providers such
//! as [Let's Encrypt](https://letsencrypt.org/) and deploying them to a CDN edge.
//!
//! Domain ownership is proven with the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555)
//! `dns-01` challenge: a TXT record is published at `_acme-challenge.<domain>` through the DNS
//! provider, observed through public recursive resolvers, and removed again once the order has
//! been decided.
//!
//! # Workflows
//!
//! The [`Orchestrator`] strings the components together:
//!
//! - `obtain`: [`AccountManager`] → [`CertificateIssuer`] (with [`ChallengeCoordinator`]) →
//!   [`CertificateStore`];
//! - `upload`: [`CertificateStore`] → [`CdnDeployer`];
//! - `auto`: `obtain`, then `upload` only if `obtain` succeeded.
//!
//! The first stage to fail ends the workflow with a [`WorkflowError`] naming the stage.
//!
//! # Providers
//!
//! Everything that talks to the outside world sits behind a trait: [`acme::AcmeTransport`],
//! [`DnsProvider`], [`TxtResolver`] and [`CdnTransport`]. The bundled implementations are
//! [`acme::HttpAcme`], Alibaba Cloud's [`AliDns`](aliyun::AliDns) and
//! [`AliCdn`](aliyun::AliCdn), and the hickory based [`RecursiveResolver`].
//!
//! # Rate Limits
//!
//! Let's Encrypt uses [rate limits] to ensure the API is not being abused. Use the staging
//! environment for development, see [`config::Environment::Staging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod account;
mod cdn;
mod challenge;
mod domain;
mod error;
mod issuer;
mod orchestrator;
mod poll;
mod resolver;
mod store;

pub mod acme;
pub mod aliyun;
pub mod config;


pub use crate::{
    account::{AccountManager, AcmeAccount},
    cdn::{
        Ack, CdnCertificateBinding, CdnDeployer, CdnTransport, CertificateStatus, DeploymentResult,
    },
    challenge::{
        challenge_record_name, ChallengeCoordinator, ChallengeHandle, ChallengeState, DnsChallenge,
        DnsProvider,
    },
    domain::Domain,
    error::{Error, Result, Stage, WorkflowError},
    issuer::CertificateIssuer,
    orchestrator::{Orchestrator, Outcome, StoredBundle},
    poll::Poller,
    resolver::{RecursiveResolver, TxtResolver, DEFAULT_NAMESERVERS},
    store::{CertificateBundle, CertificateStore},
};
