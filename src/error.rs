//! Error taxonomy shared by the proxy components
//!
//! Each component reports its own typed error; [`Error`] folds them into
//! the categories the process acts on at startup.

use crate::cert_cache::CacheError;
use crate::chain::ChainError;
use crate::config::ConfigError;
use crate::database::DbError;
use crate::proxy::ProxyError;
use thiserror::Error;

/// Result type alias for application-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Exit status used when a listener cannot be bound
pub const EXIT_BIND_FAILURE: i32 = 99;

/// Exit status for any other fatal startup failure
pub const EXIT_STARTUP_FAILURE: i32 = 1;

/// Application error kinds
#[derive(Error, Debug)]
pub enum Error {
    /// Missing data path, malformed addresses, missing chain settings
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Certificate cache directory is unsafe or unusable
    #[error("certificate cache error: {0}")]
    Cache(#[from] CacheError),

    /// Domain database could not be opened or written
    #[error("persistence error: {0}")]
    Persistence(#[from] DbError),

    /// Chain push failed
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// Proxy listener or TLS failure
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// Anything else (I/O on the data path, signal setup)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Proxy(ProxyError::Bind { .. }) => EXIT_BIND_FAILURE,
            _ => EXIT_STARTUP_FAILURE,
        }
    }
}
