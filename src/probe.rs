//! Liveness and readiness endpoints
//!
//! `/healthz` answers as soon as the process serves HTTP. `/readyz` answers
//! 200 only after [`Readiness::mark_ready`], once the webhook listens and its
//! configuration is installed. Standby replicas without the leader lease
//! are ready too.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::info;

/// Default bind address of the probe server
pub const DEFAULT_PROBE_ADDR: &str = "0.0.0.0:8081";

/// Shared readiness flag
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Flag starting out not ready
    pub fn new() -> Self {
        Self::default()
    }

    /// Report ready from now on
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Current state
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Router serving the probe endpoints
pub fn probe_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

/// Serve probes over plain HTTP
pub async fn serve(addr: SocketAddr, readiness: Readiness) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting probe server");
    axum::serve(listener, probe_router(readiness)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let response = probe_router(Readiness::new())
            .oneshot(get_request("/healthz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Story: the probe reports unavailable until startup completes, then ok.
    #[tokio::test]
    async fn story_readyz_follows_startup() {
        let readiness = Readiness::new();
        let router = probe_router(readiness.clone());

        let response = router
            .clone()
            .oneshot(get_request("/readyz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_ready();

        let response = router.oneshot(get_request("/readyz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn default_address_parses() {
        let addr: SocketAddr = DEFAULT_PROBE_ADDR.parse().unwrap();
        assert_eq!(addr.port(), 8081);
    }
}
