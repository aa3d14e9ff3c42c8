//! On-disk certificate cache
//!
//! Certificates and private keys are stored in the clear, so the cache
//! directory must be owner-only before anything is written to it. An
//! existing directory with looser permissions is refused, never fixed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::database::normalize_domain;

/// Errors raised by the certificate cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{path} has mode {mode:o}, group/world access is not allowed (expected 0700)")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    #[error("invalid domain name '{0}'")]
    InvalidDomain(String),

    #[error("corrupt cache metadata for '{domain}': {source}")]
    Metadata {
        domain: String,
        source: serde_json::Error,
    },

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Whether this is a permission precondition failure
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            CacheError::NotADirectory { .. } | CacheError::InsecurePermissions { .. }
        )
    }
}

/// A cached certificate with its private key
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateEntry {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct EntryMetadata {
    expires_at: DateTime<Utc>,
}

/// Permission-checked certificate store
#[derive(Debug, Clone)]
pub struct CertCache {
    dir: PathBuf,
}

impl CertCache {
    /// Open the cache directory, creating it with mode 0700 if absent
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let dir = path.as_ref().to_path_buf();

        match fs::metadata(&dir) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(CacheError::NotADirectory { path: dir });
                }
                check_owner_only(&dir, &meta)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                create_owner_only(&dir)?;
                info!("Created certificate cache directory {}", dir.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the entry for a domain, if a complete one is cached
    pub fn get(&self, domain: &str) -> Result<Option<CertificateEntry>, CacheError> {
        let base = self.base_name(domain)?;

        let meta = match fs::read_to_string(self.dir.join(format!("{}.json", base))) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMetadata =
            serde_json::from_str(&meta).map_err(|source| CacheError::Metadata {
                domain: domain.to_string(),
                source,
            })?;

        let cert_pem = fs::read_to_string(self.dir.join(format!("{}.crt", base)))?;
        let key_pem = fs::read_to_string(self.dir.join(format!("{}.key", base)))?;

        Ok(Some(CertificateEntry {
            cert_pem,
            key_pem,
            expires_at: meta.expires_at,
        }))
    }

    /// Store the entry for a domain
    ///
    /// Metadata is written last: a partially written entry reads as a miss.
    pub fn put(&self, domain: &str, entry: &CertificateEntry) -> Result<(), CacheError> {
        let base = self.base_name(domain)?;

        write_atomic(&self.dir.join(format!("{}.key", base)), entry.key_pem.as_bytes(), 0o600)?;
        write_atomic(&self.dir.join(format!("{}.crt", base)), entry.cert_pem.as_bytes(), 0o644)?;

        let meta = serde_json::to_vec_pretty(&EntryMetadata {
            expires_at: entry.expires_at,
        })
        .map_err(|source| CacheError::Metadata {
            domain: domain.to_string(),
            source,
        })?;
        write_atomic(&self.dir.join(format!("{}.json", base)), &meta, 0o644)?;

        debug!(domain = %domain, expires_at = %entry.expires_at, "certificate cached");
        Ok(())
    }

    /// File stem for a domain
    fn base_name(&self, domain: &str) -> Result<String, CacheError> {
        let domain =
            normalize_domain(domain).map_err(|_| CacheError::InvalidDomain(domain.to_string()))?;
        Ok(domain.replace('*', "wildcard"))
    }
}

#[cfg(unix)]
fn check_owner_only(dir: &Path, meta: &fs::Metadata) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CacheError::InsecurePermissions {
            path: dir.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_dir: &Path, _meta: &fs::Metadata) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(unix)]
fn create_owner_only(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new().mode(0o700).create(dir)?;
    // the umask may have narrowed the mode further, never widened it
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_owner_only(dir: &Path) -> io::Result<()> {
    fs::create_dir(dir)
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&tmp)?;
        io::Write::write_all(&mut file, contents)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)
}
