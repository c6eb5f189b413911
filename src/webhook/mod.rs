//! Mutating admission webhook for Pods
//!
//! Intercepts Pod creation and injects workload identity credentials for
//! the Pod's ServiceAccount. See [`pod`] for the mutation itself.

pub mod patch;
pub mod pod;
pub mod registration;
pub mod server;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};

pub use pod::{CredentialInjector, IdentityPolicy, KubeAdmissionStore};
pub use registration::ensure_webhook_config;
pub use server::{WebhookServer, WebhookServerConfig};

/// Path the API server posts Pod admission reviews to
pub const MUTATE_PODS_PATH: &str = "/mutate/pods";

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The admission review request was invalid or malformed
    #[error("invalid admission review: {0}")]
    InvalidReview(String),

    /// TLS material could not be loaded
    #[error("TLS config error: {0}")]
    Tls(String),

    /// The server stopped with an I/O error
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    /// The server task ended without an I/O error
    #[error("server stopped: {0}")]
    Stopped(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
            WebhookError::Tls(_) | WebhookError::Io(_) | WebhookError::Stopped(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Pod mutation logic
    pub injector: Arc<CredentialInjector>,
}

impl WebhookState {
    /// Create a new webhook state around an injector
    pub fn new(injector: CredentialInjector) -> Self {
        Self {
            injector: Arc::new(injector),
        }
    }
}

/// Create the webhook router with all mutation endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PODS_PATH, post(pod::mutate_handler))
        .with_state(state)
}
