//! GCPCluster gate
//!
//! Decides whether a GCPCluster is eligible for federation and, once it is,
//! registers its membership and writes the membership secret into the
//! workload cluster. Every trigger re-evaluates the whole pipeline:
//!
//! | state | outcome |
//! |---|---|
//! | annotation absent | no-op |
//! | cluster not ready | no-op |
//! | control plane not ready | recheck after 15s |
//! | kubeconfig missing or invalid | error |
//! | no ready node | recheck after 15s |
//! | ready | register membership, create secret, resync after 5m |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::controller::Action;
use kube::{Client, Config, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::crd::{GCPCluster, KubeadmControlPlane};
use crate::federation::record::membership_secret;
use crate::federation::{ClusterIdentity, FederationClient, MembershipReconciler};
use crate::{Error, DEFAULT_MEMBERSHIP_SECRET_NAMESPACE, MANAGED_BY};

/// Delay before re-checking a cluster whose control plane or nodes are not ready
pub const CONTROL_PLANE_RECHECK: Duration = Duration::from_secs(15);

/// Interval at which federated clusters are re-evaluated
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Key holding the kubeconfig inside the Cluster API `{cluster}-kubeconfig` secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Path of the service account issuer key set on every API server
pub const JWKS_PATH: &str = "/openid/v1/jwks";

const WORKLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WORKLOAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads from the management cluster needed to gate a GCPCluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Readiness of the cluster's KubeadmControlPlane, false when it does not exist
    async fn control_plane_ready(&self, namespace: &str, cluster: &str) -> Result<bool, Error>;

    /// Raw kubeconfig of the workload cluster, `None` when the secret or key is absent
    async fn kubeconfig(&self, namespace: &str, cluster: &str) -> Result<Option<Vec<u8>>, Error>;
}

/// Opens a connection to a workload cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadConnector: Send + Sync {
    /// Connect using a kubeconfig document
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn WorkloadCluster>, Error>;
}

/// Operations performed inside a workload cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadCluster: Send + Sync {
    /// Whether at least one node reports `Ready=True`
    async fn has_ready_node(&self) -> Result<bool, Error>;

    /// Fetch the service account issuer key set
    async fn fetch_jwks(&self) -> Result<Vec<u8>, Error>;

    /// Create a secret; an existing secret surfaces as a conflict error
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// Management cluster reads through the kube API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn control_plane_ready(&self, namespace: &str, cluster: &str) -> Result<bool, Error> {
        let api: Api<KubeadmControlPlane> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .get_opt(cluster)
            .await?
            .map(|cp| cp.is_ready())
            .unwrap_or(false))
    }

    async fn kubeconfig(&self, namespace: &str, cluster: &str) -> Result<Option<Vec<u8>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(&format!("{cluster}-kubeconfig")).await?;

        Ok(secret
            .and_then(|s| s.data)
            .and_then(|data| data.get(KUBECONFIG_SECRET_KEY).map(|v| v.0.clone())))
    }
}

/// Builds kube clients from Cluster API kubeconfig secrets
#[derive(Default)]
pub struct KubeconfigConnector;

#[async_trait]
impl WorkloadConnector for KubeconfigConnector {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn WorkloadCluster>, Error> {
        let text = std::str::from_utf8(kubeconfig)
            .map_err(|e| Error::kubeconfig(format!("kubeconfig is not UTF-8: {e}")))?;
        let kubeconfig = Kubeconfig::from_yaml(text)
            .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {e}")))?;

        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::kubeconfig(format!("failed to load kubeconfig: {e}")))?;
        config.connect_timeout = Some(WORKLOAD_CONNECT_TIMEOUT);
        config.read_timeout = Some(WORKLOAD_READ_TIMEOUT);

        let client = Client::try_from(config)
            .map_err(|e| Error::kubeconfig(format!("failed to create client: {e}")))?;
        Ok(Arc::new(KubeWorkloadCluster::new(client)))
    }
}

/// Workload cluster operations through the kube API
pub struct KubeWorkloadCluster {
    client: Client,
}

impl KubeWorkloadCluster {
    /// Create over an already connected client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadCluster for KubeWorkloadCluster {
    async fn has_ready_node(&self) -> Result<bool, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&Default::default()).await?;
        Ok(nodes.items.iter().any(node_is_ready))
    }

    async fn fetch_jwks(&self) -> Result<Vec<u8>, Error> {
        let request = http::Request::get(JWKS_PATH)
            .body(Vec::new())
            .map_err(|e| Error::transport(format!("failed to build JWKS request: {e}")))?;
        let body = self.client.request_text(request).await?;
        Ok(body.into_bytes())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_MEMBERSHIP_SECRET_NAMESPACE);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(MANAGED_BY.to_string()),
            ..Default::default()
        };
        api.create(&params, secret).await?;
        Ok(())
    }
}

/// Whether a node reports the `Ready` condition as `True`
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Controller context for the cluster gate
pub struct Context {
    /// Management cluster reads
    pub store: Arc<dyn ClusterStore>,
    /// Workload cluster connections
    pub connector: Arc<dyn WorkloadConnector>,
    /// Membership registration
    pub memberships: MembershipReconciler,
    /// Namespace of the membership secret in workload clusters
    pub secret_namespace: String,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, federation: Arc<dyn FederationClient>) -> ContextBuilder {
        ContextBuilder::new(client, federation)
    }

    /// Create a context for testing with custom mock ports
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ClusterStore>,
        connector: Arc<dyn WorkloadConnector>,
        federation: Arc<dyn FederationClient>,
    ) -> Self {
        Self {
            store,
            connector,
            memberships: MembershipReconciler::new(federation),
            secret_namespace: DEFAULT_MEMBERSHIP_SECRET_NAMESPACE.to_string(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client, Arc::new(gkehub))
///     .secret_namespace("giantswarm")
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    federation: Arc<dyn FederationClient>,
    store: Option<Arc<dyn ClusterStore>>,
    connector: Option<Arc<dyn WorkloadConnector>>,
    secret_namespace: String,
}

impl ContextBuilder {
    fn new(client: Client, federation: Arc<dyn FederationClient>) -> Self {
        Self {
            client,
            federation,
            store: None,
            connector: None,
            secret_namespace: DEFAULT_MEMBERSHIP_SECRET_NAMESPACE.to_string(),
        }
    }

    /// Set the namespace the membership secret is written to
    pub fn secret_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.secret_namespace = namespace.into();
        self
    }

    /// Override the management cluster store
    pub fn cluster_store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the workload cluster connector
    pub fn workload_connector(mut self, connector: Arc<dyn WorkloadConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeClusterStore::new(self.client.clone()))),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(KubeconfigConnector)),
            memberships: MembershipReconciler::new(self.federation),
            secret_namespace: self.secret_namespace,
        }
    }
}

/// Reconcile a GCPCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<GCPCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::configuration(format!("GCPCluster {name} has no namespace")))?;

    if !cluster.workload_identity_enabled() {
        debug!("workload identity not enabled, skipping");
        return Ok(Action::await_change());
    }

    if !cluster.is_ready() {
        info!("cluster not ready yet, skipping");
        return Ok(Action::await_change());
    }

    if !ctx.store.control_plane_ready(&namespace, &name).await? {
        info!("control plane not ready, rechecking later");
        return Ok(Action::requeue(CONTROL_PLANE_RECHECK));
    }

    let kubeconfig = ctx
        .store
        .kubeconfig(&namespace, &name)
        .await?
        .ok_or_else(|| {
            Error::kubeconfig(format!(
                "secret {namespace}/{name}-kubeconfig missing or has no {KUBECONFIG_SECRET_KEY} entry"
            ))
        })?;
    let workload = ctx.connector.connect(&kubeconfig).await?;

    if !workload.has_ready_node().await? {
        info!("no ready node in workload cluster, rechecking later");
        return Ok(Action::requeue(CONTROL_PLANE_RECHECK));
    }

    let jwks = workload.fetch_jwks().await?;
    let identity = ClusterIdentity::from_cluster(&cluster)?;
    let membership = ctx.memberships.reconcile(&identity, jwks).await?;

    let secret = membership_secret(&membership, &name, &ctx.secret_namespace)?;
    match workload.create_secret(&secret).await {
        Ok(()) => info!(namespace = %ctx.secret_namespace, "membership secret created"),
        Err(e) if e.is_conflict() => debug!("membership secret already exists"),
        Err(e) => return Err(e),
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Error policy for the cluster gate
///
/// Transient failures are retried quickly. Configuration problems wait for
/// the resync interval since only an outside change can fix them.
pub fn error_policy(cluster: Arc<GCPCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(RESYNC_INTERVAL)
    }
}
