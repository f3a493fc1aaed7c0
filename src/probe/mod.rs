//! Liveness and readiness probe endpoints
//!
//! Each probe server runs a set of named checks on every request. All
//! checks passing yields `200 ok`; any failure yields `500` with the
//! failing checks' errors in the body so probe logs explain the failure.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// A single health check evaluated on every probe request
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Check: Send + Sync {
    /// Name used in failure bodies
    fn name(&self) -> &str;

    /// Evaluate the check
    async fn check(&self) -> crate::Result<()>;
}

/// Adapter turning an async closure into a [`Check`]
pub struct FnCheck<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::Result<()>> + Send,
{
    /// Wrap a closure as a named check
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> Check for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = crate::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> crate::Result<()> {
        (self.f)().await
    }
}

#[derive(Clone)]
struct ProbeState {
    checks: Arc<Vec<Arc<dyn Check>>>,
}

/// HTTP server answering kubelet probe requests.
///
/// Liveness serves `GET /healthz`, readiness serves `GET /readyz`.
pub struct ProbeServer {
    kind: &'static str,
    path: &'static str,
    checks: Vec<Arc<dyn Check>>,
}

impl ProbeServer {
    /// Create a liveness probe server
    pub fn liveness() -> Self {
        Self {
            kind: "liveness",
            path: "/healthz",
            checks: Vec::new(),
        }
    }

    /// Create a readiness probe server
    pub fn readiness() -> Self {
        Self {
            kind: "readiness",
            path: "/readyz",
            checks: Vec::new(),
        }
    }

    /// Register a check evaluated on every request
    pub fn add_check(mut self, check: Arc<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    fn router(&self) -> Router {
        let state = ProbeState {
            checks: Arc::new(self.checks.clone()),
        };
        Router::new()
            .route(self.path, get(handle_probe))
            .with_state(state)
    }

    /// Bind and serve until the token is cancelled.
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> crate::Result<()> {
        let kind = self.kind;
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::validation(format!("failed to bind {kind} probe {addr}: {e}")))?;
        info!(kind, %addr, "Probe server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::validation(format!("{kind} probe server failed: {e}")))
    }
}

async fn handle_probe(State(state): State<ProbeState>) -> (StatusCode, String) {
    let mut failures = Vec::new();
    for check in state.checks.iter() {
        if let Err(e) = check.check().await {
            warn!(check = check.name(), error = %e, "Probe check failed");
            failures.push(format!("{}: {e}", check.name()));
        }
    }
    if failures.is_empty() {
        (StatusCode::OK, "ok".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, failures.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn probe(server: ProbeServer) -> (StatusCode, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let path = server.path;
        let router = server.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}{path}")).await.unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        (status, response.text().await.unwrap())
    }

    #[tokio::test]
    async fn no_checks_is_healthy() {
        let (status, body) = probe(ProbeServer::liveness()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn passing_checks_return_ok() {
        let server = ProbeServer::readiness()
            .add_check(Arc::new(FnCheck::new("always-up", || async { Ok(()) })));
        let (status, body) = probe(server).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn failing_check_returns_500_with_its_error() {
        let server = ProbeServer::readiness()
            .add_check(Arc::new(FnCheck::new("process", || async {
                Err(Error::process("database process is not running"))
            })))
            .add_check(Arc::new(FnCheck::new("cache", || async { Ok(()) })));
        let (status, body) = probe(server).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("process:"), "got: {body}");
        assert!(body.contains("not running"), "got: {body}");
    }

    #[tokio::test]
    async fn all_failing_checks_are_reported() {
        let server = ProbeServer::liveness()
            .add_check(Arc::new(FnCheck::new("a", || async {
                Err(Error::process("first"))
            })))
            .add_check(Arc::new(FnCheck::new("b", || async {
                Err(Error::process("second"))
            })));
        let (status, body) = probe(server).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("first") && body.contains("second"), "got: {body}");
    }

    #[tokio::test]
    async fn serve_stops_on_cancellation() {
        let token = CancellationToken::new();
        let server = ProbeServer::liveness();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let task = {
            let token = token.clone();
            tokio::spawn(async move { server.serve(addr, token).await })
        };
        token.cancel();
        task.await.unwrap().unwrap();
    }
}
