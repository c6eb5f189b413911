//! Controller runner - builds controller futures for each reconciler
//!
//! Each `build_*` function returns a boxed future that the binary composes
//! with the webhook and probe servers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use super::cluster::{self, Context};
use super::identity::{self, IdentityContext};
use crate::crd::GCPCluster;
use crate::federation::FederationClient;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the GCPCluster gate controller
pub fn build_cluster_controller(
    client: Client,
    federation: Arc<dyn FederationClient>,
    secret_namespace: String,
    workers: u16,
) -> ControllerFuture {
    let ctx = Arc::new(
        Context::builder(client.clone(), federation)
            .secret_namespace(secret_namespace)
            .build(),
    );
    let clusters: Api<GCPCluster> = Api::all(client);

    tracing::info!(workers, "- GCPCluster controller");

    Box::pin(
        Controller::new(
            clusters,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(workers))
        .shutdown_on_signal()
        .run(cluster::reconcile, cluster::error_policy, ctx)
        .for_each(log_reconcile_result("GCPCluster")),
    )
}

/// Build the ServiceAccount credential controller
pub fn build_identity_controller(
    client: Client,
    membership_namespace: String,
    workers: u16,
) -> ControllerFuture {
    let ctx = Arc::new(IdentityContext::new(client.clone(), membership_namespace));
    let service_accounts: Api<ServiceAccount> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    tracing::info!(workers, "- ServiceAccount controller (owns credential Secrets)");

    Box::pin(
        Controller::new(
            service_accounts,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(secrets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .with_config(ControllerConfig::default().concurrency(workers))
        .shutdown_on_signal()
        .run(identity::reconcile, identity::error_policy, ctx)
        .for_each(log_reconcile_result("ServiceAccount")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
