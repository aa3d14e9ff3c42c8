//! Management surface
//!
//! Served on the management domain through the HTTPS listener and, for a
//! parent proxy, on a dedicated chain listener as well.

use crate::chain::{ChainController, PSK_HEADER_NAME};
use crate::config::ChainMode;
use crate::proxy::{json_response, ProxyBody};
use crate::routing::RoutingTable;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Largest accepted push body
pub const MAX_PUSH_BODY: usize = 1024 * 1024;

/// Answers health, listing and chain push requests
pub struct ManagementService {
    routes: Arc<RoutingTable>,
    chain: Arc<ChainController>,
}

impl ManagementService {
    pub fn new(routes: Arc<RoutingTable>, chain: Arc<ChainController>) -> Self {
        Self { routes, chain }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/health") => self.health(),
            (&Method::GET, "/domains") => self.list_domains(&req),
            (&Method::POST, "/domains") => self.receive_push(req).await,
            (_, "/health") | (_, "/domains") => error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ),
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn health(&self) -> Response<ProxyBody> {
        let mode = match self.chain.mode() {
            ChainMode::Standalone => "standalone",
            ChainMode::Parent => "parent",
            ChainMode::Child => "child",
        };

        json_response(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "mode": mode,
                "domains": self.routes.snapshot().len(),
            }),
        )
    }

    /// Backend addresses are internal; listing needs the chain key when one is set
    fn list_domains(&self, req: &Request<Incoming>) -> Response<ProxyBody> {
        if let Err(e) = self.chain.authorize(presented_psk(req).as_deref()) {
            warn!("domain listing rejected: bad pre-shared key");
            return error_response(e.status(), &e.to_string());
        }

        let records: Vec<_> = self
            .routes
            .database()
            .snapshot()
            .values()
            .map(|record| {
                json!({
                    "domain": record.domain,
                    "backend": record.backend.as_str(),
                    "owner": record.owner.as_str(),
                    "updatedAt": record.updated_at,
                })
            })
            .collect();

        json_response(StatusCode::OK, &json!(records))
    }

    async fn receive_push(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if self.chain.mode() != ChainMode::Parent {
            return error_response(StatusCode::NOT_FOUND, "not found");
        }

        let psk = presented_psk(&req);

        let body = match Limited::new(req.into_body(), MAX_PUSH_BODY).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "push body too large");
            }
            Err(e) => {
                debug!("failed to read chain push body: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "unreadable body");
            }
        };

        // the merge is a synchronous, fsync'd SQLite transaction
        let chain = self.chain.clone();
        let merged =
            tokio::task::spawn_blocking(move || chain.receive_push(psk.as_deref(), &body)).await;

        match merged {
            Ok(Ok(summary)) => json_response(
                StatusCode::OK,
                &json!({
                    "accepted": summary.added + summary.updated,
                    "added": summary.added,
                    "updated": summary.updated,
                    "removed": summary.removed,
                }),
            ),
            Ok(Err(e)) => error_response(e.status(), &e.to_string()),
            Err(e) => {
                error!("chain push task failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

fn presented_psk<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(PSK_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json_response(status, &json!({ "error": message }))
}

/// Serve the management surface on a plain listener
pub async fn serve(listener: TcpListener, service: Arc<ManagementService>) -> std::io::Result<()> {
    info!("chain listener on {}", listener.local_addr()?);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("chain listener accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let service = service.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req: Request<Incoming>| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(service.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                debug!("chain connection error from {}: {}", remote_addr, e);
            }
        });
    }
}
