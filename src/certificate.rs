//! Certificate resolution for TLS handshakes
//!
//! The [`CertificateManager`] turns a domain into a ready rustls
//! [`ServerConfig`]: from memory, from the on-disk [`CertCache`], or by
//! asking a [`CertificateIssuer`]. Concurrent handshakes for a domain that
//! needs a certificate share one in-flight issuance.

use crate::cert_cache::{CertCache, CertificateEntry};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rcgen::generate_simple_self_signed;
use rustls::ServerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Certificates closer than this to expiry are renewed on next use
const RENEW_BEFORE_DAYS: i64 = 30;

/// Validity recorded for self-signed certificates
const SELF_SIGNED_VALIDITY_DAYS: i64 = 90;

/// Errors raised while resolving a certificate
#[derive(Error, Debug, Clone)]
pub enum CertificateError {
    #[error("no certificate available for {domain}: {reason}")]
    Unavailable { domain: String, reason: String },
}

/// Capability that obtains a fresh certificate for a domain
///
/// This is where an ACME client plugs in. An HTTP-01 client shares a
/// [`ChallengeStore`] with the manager (see
/// [`CertificateManager::with_challenges`]): it stores the key
/// authorization before asking the CA to validate and removes it once the
/// order settles.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue_or_renew(&self, domain: &str) -> anyhow::Result<CertificateEntry>;
}

/// Issuer producing self-signed certificates
pub struct SelfSignedIssuer {
    validity: Duration,
}

impl SelfSignedIssuer {
    pub fn new() -> Self {
        Self {
            validity: Duration::days(SELF_SIGNED_VALIDITY_DAYS),
        }
    }
}

impl Default for SelfSignedIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue_or_renew(&self, domain: &str) -> anyhow::Result<CertificateEntry> {
        let cert = generate_simple_self_signed(vec![domain.to_string()])?;

        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();

        info!("Generated self-signed certificate for: {}", domain);

        Ok(CertificateEntry {
            cert_pem,
            key_pem,
            expires_at: Utc::now() + self.validity,
        })
    }
}

/// ACME HTTP-01 challenge token storage
///
/// Written by the issuer, read by the plain HTTP listener under
/// `/.well-known/acme-challenge/<token>`.
#[derive(Default)]
pub struct ChallengeStore {
    challenges: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store ACME challenge token
    pub fn store(&self, token: &str, key_authorization: &str) {
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Get ACME challenge response
    pub fn get(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|c| c.value().clone())
    }

    /// Remove ACME challenge
    pub fn remove(&self, token: &str) {
        self.challenges.remove(token);
    }
}

#[derive(Clone)]
struct LoadedCertificate {
    config: Arc<ServerConfig>,
    expires_at: DateTime<Utc>,
}

type PendingIssue = Shared<BoxFuture<'static, Result<Arc<ServerConfig>, String>>>;

/// Per-domain TLS configuration with single-flight issuance
pub struct CertificateManager {
    cache: CertCache,
    issuer: Arc<dyn CertificateIssuer>,
    loaded: Arc<DashMap<String, LoadedCertificate>>,
    pending: DashMap<String, (u64, PendingIssue)>,
    next_pending: AtomicU64,
    challenges: Arc<ChallengeStore>,
}

impl CertificateManager {
    pub fn new(cache: CertCache, issuer: Arc<dyn CertificateIssuer>) -> Self {
        Self::with_challenges(cache, issuer, Arc::new(ChallengeStore::new()))
    }

    /// Build a manager whose challenge store is shared with `issuer`
    pub fn with_challenges(
        cache: CertCache,
        issuer: Arc<dyn CertificateIssuer>,
        challenges: Arc<ChallengeStore>,
    ) -> Self {
        Self {
            cache,
            issuer,
            loaded: Arc::new(DashMap::new()),
            pending: DashMap::new(),
            next_pending: AtomicU64::new(0),
            challenges,
        }
    }

    /// Challenge store served on the plain HTTP listener
    pub fn challenges(&self) -> Arc<ChallengeStore> {
        self.challenges.clone()
    }

    pub fn cache(&self) -> &CertCache {
        &self.cache
    }

    fn loaded_config(&self, domain: &str) -> Option<Arc<ServerConfig>> {
        self.loaded
            .get(domain)
            .filter(|c| is_fresh(c.expires_at))
            .map(|c| c.config.clone())
    }

    /// TLS configuration for `domain`, issuing a certificate if needed
    ///
    /// Callers must have checked that the domain is routed: this method
    /// will happily issue for any name it is given.
    pub async fn server_config(&self, domain: &str) -> Result<Arc<ServerConfig>, CertificateError> {
        if let Some(config) = self.loaded_config(domain) {
            return Ok(config);
        }

        let (id, pending) = match self.pending.entry(domain.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                // a flight may have completed between the first check and this lock
                if let Some(config) = self.loaded_config(domain) {
                    return Ok(config);
                }

                let id = self.next_pending.fetch_add(1, Ordering::Relaxed);
                let flight = Self::obtain(
                    self.cache.clone(),
                    self.issuer.clone(),
                    self.loaded.clone(),
                    domain.to_string(),
                )
                .boxed()
                .shared();
                e.insert((id, flight.clone()));
                (id, flight)
            }
        };

        let result = pending.await;
        self.pending.remove_if(domain, |_, (current, _)| *current == id);

        result.map_err(|reason| CertificateError::Unavailable {
            domain: domain.to_string(),
            reason,
        })
    }

    async fn obtain(
        cache: CertCache,
        issuer: Arc<dyn CertificateIssuer>,
        loaded: Arc<DashMap<String, LoadedCertificate>>,
        domain: String,
    ) -> Result<Arc<ServerConfig>, String> {
        let cached = match cache.get(&domain) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(domain = %domain, "ignoring unreadable cached certificate: {}", e);
                None
            }
        };

        let entry = match cached {
            Some(entry) if is_fresh(entry.expires_at) => {
                debug!(domain = %domain, "certificate cache hit");
                entry
            }
            _ => {
                info!(domain = %domain, "requesting certificate");
                let entry = issuer
                    .issue_or_renew(&domain)
                    .await
                    .map_err(|e| format!("issuance failed: {:#}", e))?;

                if let Err(e) = cache.put(&domain, &entry) {
                    warn!(domain = %domain, "failed to cache certificate: {}", e);
                }
                entry
            }
        };

        let config = build_server_config(&entry).map_err(|e| format!("{:#}", e))?;
        loaded.insert(
            domain,
            LoadedCertificate {
                config: config.clone(),
                expires_at: entry.expires_at,
            },
        );

        Ok(config)
    }
}

fn is_fresh(expires_at: DateTime<Utc>) -> bool {
    expires_at - Utc::now() > Duration::days(RENEW_BEFORE_DAYS)
}

/// Build a rustls server configuration from a PEM certificate and key
pub fn build_server_config(entry: &CertificateEntry) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut entry.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("no certificate found in PEM data");
    }

    let key = rustls_pemfile::private_key(&mut entry.key_pem.as_bytes())?
        .ok_or_else(|| anyhow!("no private key found in PEM data"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
