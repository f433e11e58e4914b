use std::{net::SocketAddr, path::PathBuf, time::Duration};

use cdncert::{
    config::{Config, Credentials, Environment, Workflow, DEFAULT_CERT_DIR, DEFAULT_REGION},
    Domain, Orchestrator, Outcome, Poller,
};
use clap::{Args, Parser, Subcommand};

/// Issue a Let's Encrypt certificate through DNS-01 on Alibaba Cloud DNS and deploy it to
/// Alibaba Cloud CDN.
#[derive(Parser, Debug)]
#[command(name = "cdncert", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a certificate and store it in the certificate directory
    Obtain(Options),
    /// Deploy the stored certificate to the CDN
    Upload(Options),
    /// Obtain, then upload
    Auto(Options),
}

#[derive(Args, Debug)]
struct Options {
    /// Domain to issue the certificate for
    #[arg(long, env = "CDNCERT_DOMAIN")]
    domain: String,

    /// ACME account contact email
    #[arg(long, env = "CDNCERT_EMAIL")]
    email: Option<String>,

    /// Alibaba Cloud DNS access key ID
    #[arg(long, env = "CDNCERT_DNS_ACCESS_KEY")]
    dns_access_key: Option<String>,

    /// Alibaba Cloud DNS access key secret
    #[arg(long, env = "CDNCERT_DNS_SECRET_KEY", hide_env_values = true)]
    dns_secret_key: Option<String>,

    /// Alibaba Cloud CDN access key ID
    #[arg(long, env = "CDNCERT_CDN_ACCESS_KEY")]
    cdn_access_key: Option<String>,

    /// Alibaba Cloud CDN access key secret
    #[arg(long, env = "CDNCERT_CDN_SECRET_KEY", hide_env_values = true)]
    cdn_secret_key: Option<String>,

    /// Use the production Let's Encrypt directory instead of staging
    #[arg(long, env = "CDNCERT_PROD")]
    prod: bool,

    /// ACME directory URL, overrides --prod
    #[arg(long, env = "CDNCERT_DIRECTORY_URL")]
    directory_url: Option<String>,

    /// CDN region
    #[arg(long, env = "CDNCERT_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// Directory certificates are stored in
    #[arg(long, env = "CDNCERT_CERT_DIR", default_value = DEFAULT_CERT_DIR)]
    cert_dir: PathBuf,

    /// Recursive resolver used to check record propagation (repeatable)
    #[arg(long = "nameserver", env = "CDNCERT_NAMESERVERS", value_delimiter = ',')]
    nameservers: Vec<SocketAddr>,

    /// Seconds to wait for the challenge record to become visible
    #[arg(long, default_value_t = 60)]
    propagation_timeout: u64,

    /// Seconds between propagation checks
    #[arg(long, default_value_t = 2)]
    propagation_interval: u64,

    /// Seconds to wait for the order to be validated
    #[arg(long, default_value_t = 90)]
    order_timeout: u64,

    /// Seconds between order status checks
    #[arg(long, default_value_t = 2)]
    order_interval: u64,
}

fn credentials(id: Option<String>, secret: Option<String>) -> Option<Credentials> {
    match (id, secret) {
        (None, None) => None,
        (id, secret) => Some(Credentials::new(
            id.unwrap_or_default(),
            secret.unwrap_or_default(),
        )),
    }
}

impl Options {
    fn into_config(self, workflow: Workflow) -> cdncert::Result<Config> {
        let mut config = Config::new(workflow, Domain::new(&self.domain)?);

        config.email = self.email;
        config.dns_credentials = credentials(self.dns_access_key, self.dns_secret_key);
        config.cdn_credentials = credentials(self.cdn_access_key, self.cdn_secret_key);
        config.environment = if self.prod {
            Environment::Production
        } else {
            Environment::Staging
        };
        config.directory_url = self.directory_url;
        config.region = self.region;
        config.cert_dir = self.cert_dir;

        if !self.nameservers.is_empty() {
            config.nameservers = self.nameservers;
        }

        config.propagation = Poller::new(
            Duration::from_secs(self.propagation_interval),
            Duration::from_secs(self.propagation_timeout),
        );
        config.order = Poller::new(
            Duration::from_secs(self.order_interval),
            Duration::from_secs(self.order_timeout),
        );

        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let (workflow, options) = match cli.command {
        Command::Obtain(options) => (Workflow::Obtain, options),
        Command::Upload(options) => (Workflow::Upload, options),
        Command::Auto(options) => (Workflow::Auto, options),
    };

    let config = options.into_config(workflow)?;

    let orchestrator = Orchestrator::from_config(&config).await?;

    match orchestrator.run(workflow).await? {
        Outcome::Stored(stored) => {
            log::info!("Certificate saved to {}", stored.cert_path.display());
            log::info!("Private key saved to {}", stored.key_path.display());
        }

        Outcome::Deployed(result) => {
            log::info!(
                "Certificate for {} deployed to the CDN in {} (request {})",
                result.binding.domain,
                result.binding.region,
                result.request_id
            );
        }
    }

    Ok(())
}
