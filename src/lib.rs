//! mulch-proxy - TLS-terminating reverse proxy
//!
//! - Domain-based routing from a durable SQLite domain database
//! - On-demand certificates, issued once per domain however many
//!   handshakes ask at the same time
//! - Atomic routing reloads on SIGHUP
//! - Parent/child chaining: a child pushes its domains to a parent proxy

pub mod app;
pub mod cert_cache;
pub mod certificate;
pub mod chain;
pub mod config;
pub mod database;
pub mod error;
pub mod management;
pub mod proxy;
pub mod routing;

pub use app::App;
pub use cert_cache::{CertCache, CertificateEntry};
pub use certificate::{CertificateIssuer, CertificateManager, SelfSignedIssuer};
pub use chain::{ChainController, ChainPushMessage, PSK_HEADER_NAME};
pub use config::{AppConfig, ChainMode, ChainSettings};
pub use database::{DomainDatabase, DomainRecord, Owner};
pub use error::{Error, Result};
pub use management::ManagementService;
pub use proxy::{ProxyConfig, ProxyServer, ServerState};
pub use routing::{Route, RoutingTable};
