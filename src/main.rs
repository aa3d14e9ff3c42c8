//! mulch-proxy - Main entry point
//!
//! TLS-terminating reverse proxy with on-demand certificates

use clap::Parser;
use mulch_proxy::config::{
    parse_listen_address, ConfigError, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING,
};
use mulch_proxy::error::EXIT_BIND_FAILURE;
use mulch_proxy::{App, AppConfig, ChainMode, ChainSettings, SelfSignedIssuer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// mulch-proxy - A TLS-terminating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "mulch-proxy")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating reverse proxy with automatic certificates")]
struct Args {
    /// Directory holding the domain database, certificates and pid file
    #[arg(long, env = "MULCH_PROXY_DATA_PATH", default_value = "./data")]
    data_path: PathBuf,

    /// Directory holding templates/error_page.html
    #[arg(long, env = "MULCH_PROXY_CONFIG_PATH", default_value = "./")]
    config_path: PathBuf,

    /// Plain HTTP listen address (ACME challenges and redirects)
    #[arg(long, env = "HTTP_ADDRESS", default_value = ":80")]
    http_address: String,

    /// HTTPS listen address
    #[arg(long, env = "HTTPS_ADDRESS", default_value = ":443")]
    https_address: String,

    /// ACME directory URL
    #[arg(long, env = "ACME_URL", default_value = LETS_ENCRYPT_PRODUCTION)]
    acme_url: String,

    /// Use the Let's Encrypt staging directory
    #[arg(long)]
    staging: bool,

    /// ACME account email
    #[arg(long, env = "ACME_EMAIL", default_value = "")]
    acme_email: String,

    /// Domain answering with the management API
    #[arg(long, env = "MANAGEMENT_DOMAIN")]
    management_domain: Option<String>,

    /// Chain federation mode
    #[arg(long, env = "CHAIN_MODE", value_enum, default_value = "standalone")]
    chain_mode: ChainMode,

    /// Parent proxy URL (child mode)
    #[arg(long, env = "CHAIN_PARENT_URL")]
    chain_parent_url: Option<String>,

    /// URL the parent should forward our domains to (child mode)
    #[arg(long, env = "CHAIN_CHILD_URL")]
    chain_child_url: Option<String>,

    /// Pre-shared key between parent and children
    #[arg(long, env = "CHAIN_PSK", hide_env_values = true)]
    chain_psk: Option<String>,

    /// Plain listener for chain pushes (parent mode)
    #[arg(long, env = "CHAIN_LISTEN")]
    chain_listen: Option<String>,

    /// Backend response timeout in seconds
    #[arg(long, env = "BACKEND_TIMEOUT", default_value = "60")]
    backend_timeout: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log everything
    #[arg(long)]
    trace: bool,
}

impl Args {
    fn into_config(self) -> Result<AppConfig, ConfigError> {
        if self.acme_email.trim().is_empty() {
            return Err(ConfigError::Missing("ACME email"));
        }

        let chain = ChainSettings::new(
            self.chain_mode,
            self.chain_parent_url.as_deref(),
            self.chain_child_url.as_deref(),
            self.chain_psk.as_deref(),
            self.chain_listen.as_deref(),
        )?;

        Ok(AppConfig {
            http_address: parse_listen_address(&self.http_address)?,
            https_address: parse_listen_address(&self.https_address)?,
            acme_url: if self.staging {
                LETS_ENCRYPT_STAGING.to_string()
            } else {
                self.acme_url
            },
            acme_email: self.acme_email,
            data_path: self.data_path,
            config_path: self.config_path,
            management_domain: self.management_domain,
            backend_timeout: Duration::from_secs(self.backend_timeout),
            chain,
        })
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = if args.trace {
        Level::TRACE
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if let Err(e) = run(args).await {
        error!("{}", e);
        let code = e.exit_code();
        if code == EXIT_BIND_FAILURE {
            error!("For 'bind: permission denied' on lower ports, you may use setcap:");
            error!("  setcap 'cap_net_bind_service=+ep' mulch-proxy");
        }
        std::process::exit(code);
    }
}

async fn run(args: Args) -> mulch_proxy::Result<()> {
    info!("Starting mulch-proxy v1.0.0");

    let config = args.into_config()?;
    info!("data path: {}", config.data_path.display());
    info!("chain mode: {:?}", config.chain.mode());
    info!("ACME directory: {} ({})", config.acme_url, config.acme_email);

    info!("certificates: self-signed issuer, ACME settings recorded only");
    let app = App::new(config, Arc::new(SelfSignedIssuer::new()))?;
    app.run().await
}
