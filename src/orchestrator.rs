//! The `obtain`, `upload` and `auto` workflows.
//!
//! Each workflow is a straight sequence of stages. The first failing stage ends the run and its
//! error is returned untouched inside a [`WorkflowError`] naming the stage.

use std::{path::PathBuf, sync::Arc};

use crate::{
    account::AccountManager,
    acme::{AcmeTransport, HttpAcme},
    aliyun::{AliCdn, AliDns},
    cdn::{ensure_artifact, CdnDeployer, DeploymentResult},
    challenge::ChallengeCoordinator,
    config::{Config, Workflow},
    domain::Domain,
    error::{Error, Stage, WorkflowError},
    issuer::CertificateIssuer,
    resolver::RecursiveResolver,
    store::CertificateStore,
};

/// Locations of a bundle written by `obtain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBundle {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stored(StoredBundle),
    Deployed(DeploymentResult),
}

struct Issuance {
    email: String,
    accounts: AccountManager,
    issuer: CertificateIssuer,
}

/// Runs the certificate workflows for one domain.
///
/// Issuance and deployment are optional so that a run only needs credentials for what it
/// actually does.
pub struct Orchestrator {
    domain: Domain,
    store: CertificateStore,
    issuance: Option<Issuance>,
    deployer: Option<CdnDeployer>,
}

impl Orchestrator {
    pub fn new(domain: Domain, store: CertificateStore) -> Self {
        Orchestrator {
            domain,
            store,
            issuance: None,
            deployer: None,
        }
    }

    /// Enables `obtain`, registering the account with `email`.
    pub fn with_issuance(
        mut self,
        email: impl Into<String>,
        accounts: AccountManager,
        issuer: CertificateIssuer,
    ) -> Self {
        self.issuance = Some(Issuance {
            email: email.into(),
            accounts,
            issuer,
        });
        self
    }

    /// Enables `upload`.
    pub fn with_deployer(mut self, deployer: CdnDeployer) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Builds the production collaborators the configured workflow needs.
    ///
    /// Connecting to the ACME directory happens here, so a failure is reported as a setup
    /// failure.
    pub async fn from_config(config: &Config) -> Result<Self, WorkflowError> {
        let setup = |err: Error| WorkflowError::new(Stage::Setup, err);

        config.validate().map_err(setup)?;

        let mut orchestrator = Orchestrator::new(
            config.domain.clone(),
            CertificateStore::new(config.cert_dir.clone()),
        );

        if config.workflow.obtains() {
            let (Some(email), Some(dns_credentials)) = (&config.email, &config.dns_credentials)
            else {
                return Err(setup(Error::Config(
                    "email and DNS credentials are required to obtain certificates".to_owned(),
                )));
            };

            let acme: Arc<dyn AcmeTransport> = Arc::new(
                HttpAcme::connect(config.directory_url())
                    .await
                    .map_err(setup)?,
            );
            let dns = Arc::new(AliDns::new(dns_credentials.clone()).map_err(setup)?);
            let resolver = Arc::new(RecursiveResolver::new(&config.nameservers).map_err(setup)?);

            let challenges =
                ChallengeCoordinator::new(acme.clone(), dns, resolver, config.propagation);
            let issuer = CertificateIssuer::new(acme.clone(), challenges, config.order);

            orchestrator =
                orchestrator.with_issuance(email.clone(), AccountManager::new(acme), issuer);
        }

        if config.workflow.uploads() {
            let Some(cdn_credentials) = &config.cdn_credentials else {
                return Err(setup(Error::Config(
                    "CDN credentials are required to upload certificates".to_owned(),
                )));
            };

            let cdn = AliCdn::new(cdn_credentials.clone()).map_err(setup)?;
            orchestrator =
                orchestrator.with_deployer(CdnDeployer::new(Arc::new(cdn), config.region.clone()));
        }

        Ok(orchestrator)
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub async fn run(&self, workflow: Workflow) -> Result<Outcome, WorkflowError> {
        log::info!("Running {workflow} for {}", self.domain);

        match workflow {
            Workflow::Obtain => self.obtain().await.map(Outcome::Stored),
            Workflow::Upload => self.upload().await.map(Outcome::Deployed),
            Workflow::Auto => self.auto().await.map(Outcome::Deployed),
        }
    }

    /// Registers the account, issues a certificate and stores it.
    pub async fn obtain(&self) -> Result<StoredBundle, WorkflowError> {
        let Some(issuance) = &self.issuance else {
            return Err(not_configured("certificate issuance"));
        };

        let account = issuance
            .accounts
            .ensure_account(&issuance.email)
            .await
            .map_err(|err| WorkflowError::new(Stage::Account, err))?;

        let bundle = issuance
            .issuer
            .issue(&account, &self.domain)
            .await
            .map_err(|err| WorkflowError::new(Stage::Issuance, err))?;

        let (cert_path, key_path) = self
            .store
            .save(&bundle)
            .map_err(|err| WorkflowError::new(Stage::Storage, err))?;

        Ok(StoredBundle {
            cert_path,
            key_path,
        })
    }

    /// Deploys the stored certificate to the CDN.
    pub async fn upload(&self) -> Result<DeploymentResult, WorkflowError> {
        let Some(deployer) = &self.deployer else {
            return Err(not_configured("CDN deployment"));
        };

        let (cert_path, key_path) = self.store.paths(&self.domain);

        ensure_artifact(&cert_path)
            .and_then(|()| ensure_artifact(&key_path))
            .map_err(|err| WorkflowError::new(Stage::Storage, err))?;

        deployer
            .deploy(&self.domain, &cert_path, &key_path)
            .await
            .map_err(|err| WorkflowError::new(Stage::Deployment, err))
    }

    /// `obtain`, then `upload` if obtaining succeeded.
    pub async fn auto(&self) -> Result<DeploymentResult, WorkflowError> {
        let stored = self.obtain().await?;
        log::info!("Certificate stored at {}", stored.cert_path.display());

        self.upload().await
    }
}

fn not_configured(what: &str) -> WorkflowError {
    WorkflowError::new(
        Stage::Setup,
        Error::Config(format!("{what} is not configured")),
    )
}
