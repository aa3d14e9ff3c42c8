//! Process wiring
//!
//! Builds every component from an [`AppConfig`] in startup order and owns
//! the reload trigger.

use crate::cert_cache::CertCache;
use crate::certificate::{CertificateIssuer, CertificateManager};
use crate::chain::ChainController;
use crate::config::{AppConfig, ChainMode, ChainSettings};
use crate::database::{DbError, DomainDatabase};
use crate::error::Result;
use crate::management::{self, ManagementService};
use crate::proxy::{ProxyConfig, ProxyError, ProxyServer};
use crate::routing::RoutingTable;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// A fully assembled proxy process
pub struct App {
    config: AppConfig,
    routes: Arc<RoutingTable>,
    chain: Arc<ChainController>,
    management: Arc<ManagementService>,
    proxy: Arc<ProxyServer>,
}

impl App {
    /// Assemble the components; nothing is bound or pushed yet
    pub fn new(config: AppConfig, issuer: Arc<dyn CertificateIssuer>) -> Result<Arc<Self>> {
        config.check_data_path()?;
        write_pid_file(&config);

        // only a parent may start from an empty store
        let auto_create = config.chain.mode() == ChainMode::Parent;
        let db = Arc::new(DomainDatabase::open(config.domains_db_path(), auto_create)?);
        info!("found {} domain(s) in database {}", db.count(), db.path().display());

        let cache = CertCache::init(config.certs_path())?;
        let certs = Arc::new(CertificateManager::new(cache, issuer));

        let routes = Arc::new(RoutingTable::new(db, config.management_domain.as_deref())?);
        let chain = Arc::new(ChainController::new(config.chain.clone(), routes.clone())?);
        let management = Arc::new(ManagementService::new(routes.clone(), chain.clone()));

        let proxy_config = ProxyConfig {
            http_address: config.http_address,
            https_address: config.https_address,
            backend_timeout: config.backend_timeout,
            error_template: Some(config.error_template_path()),
            ..ProxyConfig::default()
        };
        let proxy = Arc::new(ProxyServer::new(
            proxy_config,
            routes.clone(),
            certs,
            management.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            routes,
            chain,
            management,
            proxy,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn chain(&self) -> &Arc<ChainController> {
        &self.chain
    }

    pub fn proxy(&self) -> &Arc<ProxyServer> {
        &self.proxy
    }

    /// Reload the domain database; a child then refreshes its parent
    pub fn reload(&self) -> std::result::Result<usize, DbError> {
        let count = self.proxy.reload_domains()?;
        self.chain.on_reload();
        Ok(count)
    }

    /// Bind the configured listeners and serve
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.prepare().await?;
        self.proxy.clone().run().await?;
        Ok(())
    }

    /// Serve on listeners bound by the caller
    pub async fn serve(self: Arc<Self>, http: TcpListener, https: TcpListener) -> Result<()> {
        self.prepare().await?;
        self.proxy.clone().serve(http, https).await?;
        Ok(())
    }

    async fn prepare(self: &Arc<Self>) -> Result<()> {
        self.install_reload_signal()?;

        if let ChainSettings::Parent {
            listen: Some(addr), ..
        } = &self.config.chain
        {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ProxyError::Bind { addr: *addr, source })?;
            let service = self.management.clone();
            tokio::spawn(async move {
                if let Err(e) = management::serve(listener, service).await {
                    error!("chain listener stopped: {}", e);
                }
            });
        }

        // a child that cannot reach its parent must not start
        self.chain.startup().await?;
        Ok(())
    }

    #[cfg(unix)]
    fn install_reload_signal(self: &Arc<Self>) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let this = self.clone();
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading domains");
                if let Err(e) = this.reload() {
                    error!("reload failed, keeping previous routes: {}", e);
                }
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_reload_signal(self: &Arc<Self>) -> Result<()> {
        Ok(())
    }
}

fn write_pid_file(config: &AppConfig) {
    let path = config.pid_file_path();
    if let Err(e) = std::fs::write(&path, format!("{}\n", std::process::id())) {
        warn!("could not write pid file {}: {}", path.display(), e);
    }
}
