//! Application configuration
//!
//! Command-line parsing lives in the binary; this module turns the raw
//! values into a validated [`AppConfig`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Domain database file name inside the data path
pub const DOMAINS_DB_FILE: &str = "mulch-proxy-domains.db";

/// Configuration errors, all fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("data path ({0}) does not exist")]
    MissingDataPath(PathBuf),

    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    #[error("invalid URL for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Chain federation mode, fixed at process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ChainMode {
    Standalone,
    Parent,
    Child,
}

/// Mode-specific chain data
#[derive(Debug, Clone)]
pub enum ChainSettings {
    Standalone,
    Parent {
        psk: String,
        listen: Option<SocketAddr>,
    },
    Child {
        parent_url: Url,
        child_url: Url,
        psk: String,
    },
}

impl ChainSettings {
    /// Validate the chain flags for the selected mode
    pub fn new(
        mode: ChainMode,
        parent_url: Option<&str>,
        child_url: Option<&str>,
        psk: Option<&str>,
        listen: Option<&str>,
    ) -> Result<Self, ConfigError> {
        match mode {
            ChainMode::Standalone => Ok(ChainSettings::Standalone),
            ChainMode::Parent => Ok(ChainSettings::Parent {
                psk: require_psk(psk)?,
                listen: listen.map(parse_listen_address).transpose()?,
            }),
            ChainMode::Child => {
                let parent_url = parent_url.ok_or(ConfigError::Missing("chain parent URL"))?;
                let child_url = child_url.ok_or(ConfigError::Missing("chain child URL"))?;
                Ok(ChainSettings::Child {
                    parent_url: parse_http_url("chain parent URL", parent_url)?,
                    child_url: parse_http_url("chain child URL", child_url)?,
                    psk: require_psk(psk)?,
                })
            }
        }
    }

    pub fn mode(&self) -> ChainMode {
        match self {
            ChainSettings::Standalone => ChainMode::Standalone,
            ChainSettings::Parent { .. } => ChainMode::Parent,
            ChainSettings::Child { .. } => ChainMode::Child,
        }
    }
}

fn require_psk(psk: Option<&str>) -> Result<String, ConfigError> {
    match psk.map(str::trim) {
        Some(psk) if !psk.is_empty() => Ok(psk.to_string()),
        _ => Err(ConfigError::Missing("chain pre-shared key")),
    }
}

/// Validated application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_path: PathBuf,
    pub config_path: PathBuf,
    pub http_address: SocketAddr,
    pub https_address: SocketAddr,
    /// ACME directory and account for an ACME issuer; the self-signed
    /// issuer does not read them
    pub acme_url: String,
    pub acme_email: String,
    pub management_domain: Option<String>,
    pub backend_timeout: Duration,
    pub chain: ChainSettings,
}

impl AppConfig {
    pub fn domains_db_path(&self) -> PathBuf {
        self.data_path.join(DOMAINS_DB_FILE)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_path.join("mulch-proxy-last.pid")
    }

    pub fn certs_path(&self) -> PathBuf {
        self.data_path.join("certs")
    }

    pub fn error_template_path(&self) -> PathBuf {
        self.config_path.join("templates").join("error_page.html")
    }

    /// Fail unless the data path already exists
    pub fn check_data_path(&self) -> Result<(), ConfigError> {
        if !self.data_path.is_dir() {
            return Err(ConfigError::MissingDataPath(self.data_path.clone()));
        }
        Ok(())
    }
}

/// Parse a listen address
///
/// Accepts `ip:port`, `host:port` and the bare `:port` form, which binds
/// every interface.
pub fn parse_listen_address(value: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.trim();
    let invalid = || ConfigError::InvalidAddress(value.to_string());

    if let Some(port) = value.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }

    value
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

/// Parse an absolute http(s) URL
pub fn parse_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: format!("'{}' is not an absolute http(s) URL", value),
        });
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_port() {
        let addr = parse_listen_address(":443").unwrap();
        assert_eq!(addr, "0.0.0.0:443".parse().unwrap());
    }

    #[test]
    fn test_parse_ip_port() {
        let addr = parse_listen_address("127.0.0.1:8080").unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_parse_malformed_address() {
        assert!(matches!(
            parse_listen_address(":http"),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(parse_listen_address("no-port-here").is_err());
    }

    #[test]
    fn test_child_requires_urls_and_psk() {
        let err = ChainSettings::new(ChainMode::Child, None, Some("https://c.example.com"), Some("k"), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        let err = ChainSettings::new(
            ChainMode::Child,
            Some("https://p.example.com"),
            Some("https://c.example.com"),
            Some("  "),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        let settings = ChainSettings::new(
            ChainMode::Child,
            Some("https://p.example.com"),
            Some("https://c.example.com"),
            Some("secret"),
            None,
        )
        .unwrap();
        assert_eq!(settings.mode(), ChainMode::Child);
    }

    #[test]
    fn test_parent_url_must_be_http() {
        let err = ChainSettings::new(
            ChainMode::Child,
            Some("ftp://p.example.com"),
            Some("https://c.example.com"),
            Some("secret"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn test_missing_data_path() {
        let config = AppConfig {
            data_path: PathBuf::from("/definitely/not/here"),
            config_path: PathBuf::from("."),
            http_address: parse_listen_address(":80").unwrap(),
            https_address: parse_listen_address(":443").unwrap(),
            acme_url: LETS_ENCRYPT_STAGING.to_string(),
            acme_email: "ops@example.com".to_string(),
            management_domain: None,
            backend_timeout: Duration::from_secs(60),
            chain: ChainSettings::Standalone,
        };
        assert!(matches!(config.check_data_path(), Err(ConfigError::MissingDataPath(_))));
        assert!(config.domains_db_path().ends_with("mulch-proxy-domains.db"));
    }
}
