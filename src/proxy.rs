//! Proxy server implementation
//!
//! Terminates TLS for every routed domain and forwards requests to the
//! domain's backend. The plain HTTP listener only answers ACME challenges
//! and redirects to HTTPS.

use crate::certificate::CertificateManager;
use crate::database::{normalize_domain, DbError};
use crate::management::ManagementService;
use crate::routing::{Route, RoutingTable};
use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HOST, LOCATION,
};
use hyper::http::uri::InvalidUri;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::server::Acceptor;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};
use url::Url;

/// Body type of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a handshake waits for a certificate before giving up
pub const DEFAULT_ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const BUILTIN_ERROR_TEMPLATE: &str = include_str!("../templates/error_page.html");

/// Headers that only make sense on a single connection
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Proxy server errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("TLS handshake refused: {0}")]
    TlsPolicy(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Lifecycle of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    /// Running, with a snapshot swap executing right now
    ReloadInProgress,
}

/// Proxy server configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub http_address: SocketAddr,
    pub https_address: SocketAddr,
    pub backend_timeout: Duration,
    /// How long a handshake waits on certificate issuance
    pub issuance_timeout: Duration,
    pub error_template: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            https_address: SocketAddr::from(([0, 0, 0, 0], 8443)),
            backend_timeout: Duration::from_secs(60),
            issuance_timeout: DEFAULT_ISSUANCE_TIMEOUT,
            error_template: None,
        }
    }
}

/// HTML error page rendered for failed requests
pub struct ErrorPage {
    template: String,
}

impl ErrorPage {
    pub fn builtin() -> Self {
        Self {
            template: BUILTIN_ERROR_TEMPLATE.to_string(),
        }
    }

    /// Load a template file, falling back to the built-in page
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(template) => Self { template },
            Err(e) => {
                warn!(
                    "error page template {} unavailable ({}), using built-in page",
                    path.display(),
                    e
                );
                Self::builtin()
            }
        }
    }

    pub fn render(&self, status: StatusCode, message: &str) -> Response<ProxyBody> {
        let body = self
            .template
            .replace("{{status}}", status.as_str())
            .replace("{{reason}}", &escape_html(status.canonical_reason().unwrap_or("")))
            .replace("{{message}}", &escape_html(message));

        let mut response = Response::new(full_body(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    routes: Arc<RoutingTable>,
    certs: Arc<CertificateManager>,
    management: Arc<ManagementService>,
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    error_page: ErrorPage,
    state: Mutex<ServerState>,
    https_port: AtomicU16,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyConfig,
        routes: Arc<RoutingTable>,
        certs: Arc<CertificateManager>,
        management: Arc<ManagementService>,
    ) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client = Client::builder(TokioExecutor::new()).build(HttpsConnector::new_with_connector(http));

        let error_page = config
            .error_template
            .as_deref()
            .map(ErrorPage::load)
            .unwrap_or_else(ErrorPage::builtin);

        Self {
            https_port: AtomicU16::new(config.https_address.port()),
            config,
            routes,
            certs,
            management,
            client,
            error_page,
            state: Mutex::new(ServerState::Stopped),
        }
    }

    pub fn state(&self) -> ServerState {
        let state = *self.state.lock();
        if state == ServerState::Running && self.routes.is_reloading() {
            ServerState::ReloadInProgress
        } else {
            state
        }
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certs
    }

    /// Re-read the domain database and swap in a new routing snapshot
    ///
    /// Requests already running keep the snapshot they started with.
    pub fn reload_domains(&self) -> Result<usize, DbError> {
        self.routes.reload()
    }

    /// Bind both listeners and serve until an unrecoverable error
    ///
    /// Bind failures are returned immediately and never retried.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        self.set_state(ServerState::Starting);

        let listeners = async {
            let http = Self::bind(self.config.http_address).await?;
            let https = Self::bind(self.config.https_address).await?;
            Ok::<_, ProxyError>((http, https))
        };

        match listeners.await {
            Ok((http, https)) => self.serve(http, https).await,
            Err(e) => {
                self.set_state(ServerState::Stopped);
                Err(e)
            }
        }
    }

    async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })
    }

    /// Serve on already bound listeners
    pub async fn serve(
        self: Arc<Self>,
        http_listener: TcpListener,
        https_listener: TcpListener,
    ) -> Result<(), ProxyError> {
        let http_addr = http_listener.local_addr()?;
        let https_addr = https_listener.local_addr()?;
        self.https_port.store(https_addr.port(), Ordering::Relaxed);

        info!("HTTP server listening on {}", http_addr);
        info!("HTTPS server listening on {}", https_addr);
        self.set_state(ServerState::Running);

        let result = tokio::try_join!(
            self.clone().accept_plain(http_listener),
            self.clone().accept_tls(https_listener),
        );

        self.set_state(ServerState::Stopped);
        result.map(|_| ())
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("HTTP accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let this = this.clone();
                    async move { Ok::<_, Infallible>(this.handle_plain_request(&req)) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("HTTPS accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_tls_connection(stream, remote_addr).await {
                    debug!("HTTPS connection error from {}: {:#}", remote_addr, e);
                }
            });
        }
    }

    /// Plain HTTP: ACME challenges, everything else goes to HTTPS
    fn handle_plain_request<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let path = req.uri().path();

        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return match self.certs.challenges().get(token) {
                Some(key_auth) => text_response(StatusCode::OK, key_auth),
                None => text_response(StatusCode::NOT_FOUND, "Challenge not found"),
            };
        }

        let host = match request_host(req) {
            Some(host) => host,
            None => return text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        let https_port = self.https_port.load(Ordering::Relaxed);
        let authority = if https_port == 443 {
            host
        } else {
            format!("{}:{}", host, https_port)
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        redirect_response(&format!("https://{}{}", authority, path_and_query))
    }

    async fn handle_tls_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let start = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for ClientHello"))??;

        let server_name = start.client_hello().server_name().map(str::to_string);
        let (domain, config) = self.resolve_tls(server_name.as_deref()).await?;

        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .map_err(|_| anyhow!("TLS handshake timed out"))??;

        let domain: Arc<str> = domain.into();
        let service = service_fn(move |req: Request<Incoming>| {
            let this = self.clone();
            let domain = domain.clone();
            async move { Ok::<_, Infallible>(this.handle_request(req, remote_addr, &domain).await) }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await?;

        Ok(())
    }

    /// Decide whether to complete a handshake, and with which certificate
    ///
    /// Names outside the current routing snapshot are refused before the
    /// certificate manager is consulted, so they can never trigger issuance.
    async fn resolve_tls(
        &self,
        server_name: Option<&str>,
    ) -> Result<(String, Arc<ServerConfig>), ProxyError> {
        let requested = server_name
            .ok_or_else(|| ProxyError::TlsPolicy("client sent no server name".to_string()))?;
        let domain = normalize_domain(requested)
            .map_err(|_| ProxyError::TlsPolicy(format!("invalid server name '{}'", requested)))?;

        if !self.routes.snapshot().contains(&domain) {
            return Err(ProxyError::TlsPolicy(format!("unknown domain '{}'", domain)));
        }

        // the flight stays registered, so the next handshake picks it up again
        let issuance = self.certs.server_config(&domain);
        let config = tokio::time::timeout(self.config.issuance_timeout, issuance)
            .await
            .map_err(|_| {
                ProxyError::TlsPolicy(format!(
                    "no certificate for '{}' within {:?}",
                    domain, self.config.issuance_timeout
                ))
            })?
            .map_err(|e| ProxyError::TlsPolicy(e.to_string()))?;

        Ok((domain, config))
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        domain: &str,
    ) -> Response<ProxyBody> {
        // pinned for the whole request, whatever reloads happen meanwhile
        let snapshot = self.routes.snapshot();

        if let Some(host) = request_host(&req) {
            if normalize_domain(&host).map_or(true, |h| h != domain) {
                return self.error_page.render(
                    StatusCode::MISDIRECTED_REQUEST,
                    "The requested host does not match this connection.",
                );
            }
        }

        debug!("{} {} for {} from {}", req.method(), req.uri().path(), domain, remote_addr);

        match snapshot.route(domain).cloned() {
            Some(Route::Management) => self.management.handle(req).await,
            Some(Route::Backend(backend)) => self.forward(req, &backend, remote_addr).await,
            None => self
                .error_page
                .render(StatusCode::NOT_FOUND, "This domain is not served here."),
        }
    }

    /// Forward a request to its backend, streaming both bodies
    async fn forward(
        &self,
        req: Request<Incoming>,
        backend: &Url,
        remote_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let uri = match build_backend_uri(backend, &parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(backend = %backend, "cannot build backend URI: {}", e);
                return self
                    .error_page
                    .render(StatusCode::BAD_GATEWAY, "The service is misconfigured.");
            }
        };

        let original_host = parts.headers.get(HOST).cloned();
        strip_hop_by_hop(&mut parts.headers);

        let client_ip = remote_addr.ip().to_string();
        let forwarded_for = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            parts.headers.insert("x-forwarded-for", value);
        }
        if let Some(host) = original_host {
            parts.headers.insert("x-forwarded-host", host);
        }
        parts
            .headers
            .insert("x-forwarded-proto", HeaderValue::from_static("https"));

        parts.uri = uri;
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let request = Request::from_parts(parts, body.boxed());

        match tokio::time::timeout(self.config.backend_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                warn!(backend = %backend, "{} request to backend failed: {}", method, e);
                self.error_page
                    .render(StatusCode::BAD_GATEWAY, "The service is currently unreachable.")
            }
            Err(_) => {
                warn!(backend = %backend, "backend did not answer within {:?}", self.config.backend_timeout);
                self.error_page
                    .render(StatusCode::GATEWAY_TIMEOUT, "The service took too long to answer.")
            }
        }
    }
}

/// Host the client asked for, without port
fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))?;

    let host = if raw.starts_with('[') {
        // IPv6 literal
        raw.split(']').next().map(|h| format!("{}]", h))?
    } else {
        raw.split(':').next().unwrap_or(raw.as_str()).to_string()
    };

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Backend URI: backend base path followed by the request path and query
fn build_backend_uri(backend: &Url, uri: &Uri) -> Result<Uri, InvalidUri> {
    let host = backend.host_str().unwrap_or("localhost");
    let port = backend
        .port()
        .map(|p| format!(":{}", p))
        .unwrap_or_default();
    let base_path = backend.path().trim_end_matches('/');
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    format!(
        "{}://{}{}{}{}",
        backend.scheme(),
        host,
        port,
        base_path,
        path_and_query
    )
    .parse()
}

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Create full body
pub(crate) fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Create empty body
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create JSON response
pub(crate) fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Create redirect response
fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(location) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(LOCATION, location);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Invalid Host header"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_cache::{CertCache, CertificateEntry};
    use crate::certificate::{CertificateIssuer, SelfSignedIssuer};
    use crate::chain::ChainController;
    use crate::config::ChainSettings;
    use crate::database::{DomainDatabase, Owner};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue_or_renew(&self, domain: &str) -> anyhow::Result<CertificateEntry> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            SelfSignedIssuer::new().issue_or_renew(domain).await
        }
    }

    /// Never finishes an issuance
    struct StalledIssuer;

    #[async_trait]
    impl CertificateIssuer for StalledIssuer {
        async fn issue_or_renew(&self, _domain: &str) -> anyhow::Result<CertificateEntry> {
            std::future::pending().await
        }
    }

    fn server(dir: &TempDir, issuer: Arc<CountingIssuer>) -> ProxyServer {
        server_with(dir, issuer, ProxyConfig::default())
    }

    fn server_with(
        dir: &TempDir,
        issuer: Arc<dyn CertificateIssuer>,
        config: ProxyConfig,
    ) -> ProxyServer {
        let db = Arc::new(DomainDatabase::open(dir.path().join("domains.db"), true).unwrap());
        db.upsert("app.example.com", "http://127.0.0.1:9000", Owner::Local).unwrap();

        let routes = Arc::new(RoutingTable::new(db, Some("admin.example.com")).unwrap());
        let chain = Arc::new(ChainController::new(ChainSettings::Standalone, routes.clone()).unwrap());
        let management = Arc::new(ManagementService::new(routes.clone(), chain));
        let certs = Arc::new(CertificateManager::new(
            CertCache::init(dir.path().join("certs")).unwrap(),
            issuer,
        ));

        ProxyServer::new(config, routes, certs, management)
    }

    #[tokio::test]
    async fn test_unknown_server_name_never_issues() {
        let dir = tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let proxy = server(&dir, issuer.clone());

        for _ in 0..5 {
            let err = proxy.resolve_tls(Some("evil.example.com")).await.unwrap_err();
            assert!(matches!(err, ProxyError::TlsPolicy(_)));
        }
        assert!(proxy.resolve_tls(None).await.is_err());
        assert!(proxy.resolve_tls(Some("not a name")).await.is_err());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);

        let (domain, _) = proxy.resolve_tls(Some("APP.example.com")).await.unwrap();
        assert_eq!(domain, "app.example.com");
        assert!(proxy.resolve_tls(Some("admin.example.com")).await.is_ok());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stalled_issuance_refuses_handshake() {
        let dir = tempdir().unwrap();
        let config = ProxyConfig {
            issuance_timeout: Duration::from_millis(200),
            ..ProxyConfig::default()
        };
        let proxy = server_with(&dir, Arc::new(StalledIssuer), config);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            proxy.resolve_tls(Some("app.example.com")),
        )
        .await
        .expect("handshake wait was not bounded");

        match result {
            Err(ProxyError::TlsPolicy(message)) => assert!(message.contains("app.example.com")),
            other => panic!("expected TlsPolicy, got {:?}", other.map(|(domain, _)| domain)),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_plain_requests_redirect_to_https() {
        let dir = tempdir().unwrap();
        let proxy = server(&dir, Arc::new(CountingIssuer::default()));

        let req = Request::builder()
            .uri("/path?q=1")
            .header(HOST, "app.example.com:8080")
            .body(())
            .unwrap();
        let response = proxy.handle_plain_request(&req);

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://app.example.com:8443/path?q=1"
        );

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(proxy.handle_plain_request(&req).status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_acme_challenge_served_on_plain_listener() {
        let dir = tempdir().unwrap();
        let proxy = server(&dir, Arc::new(CountingIssuer::default()));
        proxy.certificates().challenges().store("token123", "key_auth_value");

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/token123")
            .header(HOST, "app.example.com")
            .body(())
            .unwrap();
        let response = proxy.handle_plain_request(&req);
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"key_auth_value");

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/unknown")
            .body(())
            .unwrap();
        assert_eq!(proxy.handle_plain_request(&req).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_state_starts_stopped() {
        let dir = tempdir().unwrap();
        let proxy = server(&dir, Arc::new(CountingIssuer::default()));
        assert_eq!(proxy.state(), ServerState::Stopped);
        assert_eq!(proxy.reload_domains().unwrap(), 2);
    }

    #[test]
    fn test_build_backend_uri() {
        let backend = Url::parse("http://127.0.0.1:9000").unwrap();
        let uri: Uri = "/users?id=1".parse().unwrap();
        assert_eq!(
            build_backend_uri(&backend, &uri).unwrap(),
            "http://127.0.0.1:9000/users?id=1"
        );
    }

    #[test]
    fn test_build_backend_uri_with_base_path() {
        let backend = Url::parse("https://api.external.com/v1/").unwrap();
        let uri: Uri = "/users".parse().unwrap();
        assert_eq!(
            build_backend_uri(&backend, &uri).unwrap(),
            "https://api.external.com/v1/users"
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-request-id").unwrap(), "42");
    }

    #[test]
    fn test_request_host() {
        let req = Request::builder()
            .header(HOST, "example.com:443")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.com"));

        let req = Request::builder().header(HOST, "[::1]:8443").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("[::1]"));
    }

    #[tokio::test]
    async fn test_error_page_escapes_message() {
        let page = ErrorPage::builtin();
        let response = page.render(StatusCode::BAD_GATEWAY, "<script>");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("502 Bad Gateway"));
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
    }

    #[test]
    fn test_error_page_missing_template_falls_back() {
        let dir = tempdir().unwrap();
        let page = ErrorPage::load(&dir.path().join("missing.html"));
        assert_eq!(page.template, BUILTIN_ERROR_TEMPLATE);
    }
}
