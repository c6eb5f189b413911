//! HTTPS server for the admission webhook

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::task::JoinHandle;
use tracing::info;

use super::{webhook_router, WebhookError, WebhookState};
use crate::DEFAULT_WEBHOOK_PORT;

/// Default directory holding the serving certificate
pub const DEFAULT_CERT_DIR: &str = "/etc/webhook/certs";

/// Webhook server configuration
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// Directory containing `tls.crt` and `tls.key`
    pub cert_dir: PathBuf,
}

impl Default for WebhookServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT)),
            cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
        }
    }
}

impl WebhookServerConfig {
    /// Path of the serving certificate
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join("tls.crt")
    }

    /// Path of the serving key
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join("tls.key")
    }
}

/// A webhook server accepting connections in the background
pub struct WebhookServer {
    addr: SocketAddr,
    task: JoinHandle<Result<(), WebhookError>>,
}

impl WebhookServer {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the server to stop
    pub async fn wait(self) -> Result<(), WebhookError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(WebhookError::Stopped(format!("webhook task failed: {e}"))),
        }
    }
}

/// Load the TLS material and start serving the webhook router
///
/// Returns once the listener is bound, so callers can report readiness.
pub async fn start(
    config: WebhookServerConfig,
    state: Arc<WebhookState>,
) -> Result<WebhookServer, WebhookError> {
    let tls_config = RustlsConfig::from_pem_file(config.cert_path(), config.key_path())
        .await
        .map_err(|e| {
            WebhookError::Tls(format!(
                "failed to load {}: {e}",
                config.cert_dir.display()
            ))
        })?;

    let handle = Handle::new();
    let server = axum_server::bind_rustls(config.addr, tls_config).handle(handle.clone());
    let mut task = tokio::spawn(async move {
        server
            .serve(webhook_router(state).into_make_service())
            .await
            .map_err(WebhookError::from)
    });

    tokio::select! {
        Some(addr) = handle.listening() => {
            info!(addr = %addr, "Webhook server listening");
            Ok(WebhookServer { addr, task })
        }
        result = &mut task => match result {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(WebhookError::Stopped("stopped before binding".to_string())),
            Err(e) => Err(WebhookError::Stopped(format!("webhook task failed: {e}"))),
        },
    }
}
