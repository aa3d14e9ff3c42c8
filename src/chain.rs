//! Parent/child proxy chaining
//!
//! A child proxy pushes its domain list to its parent so the parent can
//! route those domains to it. The parent accepts pushes authenticated with
//! a pre-shared key and replaces exactly the domains previously pushed by
//! the same child.

use crate::config::{parse_http_url, ChainMode, ChainSettings};
use crate::database::{DbError, Owner, ReplaceSummary};
use crate::routing::RoutingTable;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{error, info, warn};

/// Name of the HTTP header carrying the pre-shared key
pub const PSK_HEADER_NAME: &str = "Mulch-PSK";

/// Bound on every push to the parent
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a chain push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPushMessage {
    pub domains: Vec<String>,
    pub forward_to: String,
}

/// Errors on either side of a chain push
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("invalid or missing pre-shared key")]
    Unauthorized,

    #[error("malformed push: {0}")]
    Malformed(String),

    #[error("domain '{domain}' is already owned by {owner}")]
    Conflict { domain: String, owner: Owner },

    #[error("this proxy does not accept chain pushes")]
    NotParent,

    #[error("this proxy has no parent to push to")]
    NotChild,

    #[error("persistence: {0}")]
    Persistence(DbError),

    #[error("request to parent failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("parent rejected push with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl ChainError {
    /// HTTP status reported to a pushing child
    pub fn status(&self) -> StatusCode {
        match self {
            ChainError::Unauthorized => StatusCode::FORBIDDEN,
            ChainError::Malformed(_) => StatusCode::BAD_REQUEST,
            ChainError::Conflict { .. } => StatusCode::CONFLICT,
            ChainError::NotParent => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DbError> for ChainError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Conflict { domain, owner } => ChainError::Conflict { domain, owner },
            DbError::InvalidDomain(_) | DbError::InvalidBackend { .. } => {
                ChainError::Malformed(err.to_string())
            }
            other => ChainError::Persistence(other),
        }
    }
}

/// Chain behaviour of this process
pub struct ChainController {
    settings: ChainSettings,
    routes: Arc<RoutingTable>,
    client: reqwest::Client,
}

impl ChainController {
    pub fn new(settings: ChainSettings, routes: Arc<RoutingTable>) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder().timeout(PUSH_TIMEOUT).build()?;

        Ok(Self {
            settings,
            routes,
            client,
        })
    }

    pub fn mode(&self) -> ChainMode {
        self.settings.mode()
    }

    /// Startup hook: a child must reach its parent or not start at all
    pub async fn startup(&self) -> Result<(), ChainError> {
        if self.mode() == ChainMode::Child {
            self.push_to_parent().await?;
        }
        Ok(())
    }

    /// Reload hook: children push in the background, failures are only logged
    pub fn on_reload(self: &Arc<Self>) {
        if self.mode() != ChainMode::Child {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.push_to_parent().await {
                error!("refreshing parent domains: {}", e);
            }
        });
    }

    /// Message describing this child's current domains
    pub fn push_message(&self) -> Option<ChainPushMessage> {
        match &self.settings {
            ChainSettings::Child { child_url, .. } => Some(ChainPushMessage {
                domains: self.routes.database().names(),
                forward_to: child_url.to_string(),
            }),
            _ => None,
        }
    }

    /// Send our domains to the parent proxy
    pub async fn push_to_parent(&self) -> Result<(), ChainError> {
        let (parent_url, psk) = match &self.settings {
            ChainSettings::Child { parent_url, psk, .. } => (parent_url, psk),
            _ => return Err(ChainError::NotChild),
        };
        let message = self.push_message().ok_or(ChainError::NotChild)?;

        let url = format!("{}/domains", parent_url.as_str().trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header(PSK_HEADER_NAME, psk.as_str())
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ChainError::Rejected {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        info!(
            parent = %parent_url,
            domains = message.domains.len(),
            "pushed domains to parent"
        );
        Ok(())
    }

    /// Check a pre-shared key presented by a caller
    ///
    /// Always passes when no key is configured (standalone mode).
    pub fn authorize(&self, psk: Option<&str>) -> Result<(), ChainError> {
        let expected = match &self.settings {
            ChainSettings::Parent { psk, .. } | ChainSettings::Child { psk, .. } => psk,
            ChainSettings::Standalone => return Ok(()),
        };

        let authorized: bool = match psk {
            Some(given) => given.as_bytes().ct_eq(expected.as_bytes()).into(),
            None => false,
        };
        if authorized {
            Ok(())
        } else {
            Err(ChainError::Unauthorized)
        }
    }

    /// Handle a push received from a child
    ///
    /// The key is checked before the body is even parsed; a rejected push
    /// leaves the database untouched.
    pub fn receive_push(&self, psk: Option<&str>, body: &[u8]) -> Result<ReplaceSummary, ChainError> {
        if self.mode() != ChainMode::Parent {
            return Err(ChainError::NotParent);
        }

        if let Err(e) = self.authorize(psk) {
            warn!("chain push rejected: bad pre-shared key");
            return Err(e);
        }

        let message: ChainPushMessage =
            serde_json::from_slice(body).map_err(|e| ChainError::Malformed(e.to_string()))?;
        let forward_to = parse_http_url("forwardTo", &message.forward_to)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;

        let owner = Owner::child(&forward_to);
        let summary = match self
            .routes
            .database()
            .replace_owned(&owner, &message.domains, forward_to.as_str())
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(child = %forward_to, "chain push rejected: {}", e);
                return Err(e.into());
            }
        };

        info!(
            child = %forward_to,
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            "merged chain push"
        );

        // the merge is committed; a failed reload only delays routing
        if let Err(e) = self.routes.reload() {
            error!(child = %forward_to, "routing reload after merge failed: {}", e);
        }
        Ok(summary)
    }
}
