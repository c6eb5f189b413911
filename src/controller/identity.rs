//! ServiceAccount credential reconciler
//!
//! Runs in the workload cluster. Every ServiceAccount carrying the GCP
//! service account annotation gets a credential-config secret derived from
//! the membership record, owned by the ServiceAccount so it is garbage
//! collected with it. Owned secrets are watched, and annotated
//! ServiceAccounts are resynced periodically so changes to the membership
//! record reach existing secrets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::federation::record::membership_from_secret;
use crate::federation::CredentialConfig;
use crate::{
    credential_secret_name, Error, ANNOTATION_GCP_SERVICE_ACCOUNT, ANNOTATION_MANAGED_BY,
    ANNOTATION_SERVICE_ACCOUNT_NAME, DEFAULT_MEMBERSHIP_SECRET_NAMESPACE, MANAGED_BY,
    MEMBERSHIP_SECRET_NAME, SECRET_PAYLOAD_KEY,
};

/// Interval at which annotated ServiceAccounts are re-evaluated
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Secret access needed by the identity reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fetch a secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a secret
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Replace an existing secret
    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// [`IdentityStore`] backed by the kube API
pub struct KubeIdentityStore {
    client: Client,
}

impl KubeIdentityStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, secret: &Secret) -> Result<(Api<Secret>, String), Error> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::configuration("secret has no namespace"))?;
        Ok((
            Api::namespaced(self.client.clone(), &namespace),
            secret.name_any(),
        ))
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(MANAGED_BY.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl IdentityStore for KubeIdentityStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let (api, _) = self.api_for(secret)?;
        api.create(&post_params(), secret).await?;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<(), Error> {
        let (api, name) = self.api_for(secret)?;
        api.replace(&name, &post_params(), secret).await?;
        Ok(())
    }
}

/// Controller context for the identity reconciler
pub struct IdentityContext {
    /// Secret access
    pub store: Arc<dyn IdentityStore>,
    /// Namespace holding the membership secret
    pub membership_namespace: String,
}

impl IdentityContext {
    /// Context backed by the kube API
    pub fn new(client: Client, membership_namespace: impl Into<String>) -> Self {
        Self {
            store: Arc::new(KubeIdentityStore::new(client)),
            membership_namespace: membership_namespace.into(),
        }
    }

    /// Create a context for testing with a mock store
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            membership_namespace: DEFAULT_MEMBERSHIP_SECRET_NAMESPACE.to_string(),
        }
    }
}

/// Build the credential secret for a ServiceAccount
pub fn credential_secret(
    service_account: &ServiceAccount,
    config: &CredentialConfig,
) -> Result<Secret, Error> {
    let name = service_account.name_any();
    let namespace = service_account
        .namespace()
        .ok_or_else(|| Error::configuration(format!("ServiceAccount {name} has no namespace")))?;
    let owner = service_account.controller_owner_ref(&()).ok_or_else(|| {
        Error::configuration(format!("ServiceAccount {namespace}/{name} has no uid"))
    })?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(credential_secret_name(&name)),
            namespace: Some(namespace),
            annotations: Some(BTreeMap::from([
                (ANNOTATION_SERVICE_ACCOUNT_NAME.to_string(), name),
                (ANNOTATION_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            SECRET_PAYLOAD_KEY.to_string(),
            config.to_json()?,
        )])),
        ..Default::default()
    })
}

/// Reconcile a ServiceAccount
#[instrument(skip(service_account, ctx), fields(
    service_account = %service_account.name_any(),
    namespace = %service_account.namespace().unwrap_or_default(),
))]
pub async fn reconcile(
    service_account: Arc<ServiceAccount>,
    ctx: Arc<IdentityContext>,
) -> Result<Action, Error> {
    let Some(gcp_service_account) = service_account
        .annotations()
        .get(ANNOTATION_GCP_SERVICE_ACCOUNT)
        .cloned()
    else {
        debug!("no GCP service account annotation, skipping");
        return Ok(Action::await_change());
    };

    let record = ctx
        .store
        .get_secret(&ctx.membership_namespace, MEMBERSHIP_SECRET_NAME)
        .await?
        .ok_or_else(|| {
            Error::federation_record_missing(format!(
                "{}/{MEMBERSHIP_SECRET_NAME}",
                ctx.membership_namespace
            ))
        })?;
    let membership = membership_from_secret(&record)?;

    let config = CredentialConfig::new(&membership, &gcp_service_account)?;
    let mut desired = credential_secret(&service_account, &config)?;
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    match ctx.store.get_secret(&namespace, &name).await? {
        Some(existing) if is_current(&existing, &desired) => {
            debug!(secret = %name, "credential secret up to date");
        }
        Some(existing) => {
            desired.metadata.resource_version = existing.metadata.resource_version;
            ctx.store.replace_secret(&desired).await?;
            info!(secret = %name, "credential secret updated");
        }
        None => {
            ctx.store.create_secret(&desired).await?;
            info!(secret = %name, "credential secret created");
        }
    }

    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Whether a stored secret already carries the desired payload and owner
fn is_current(existing: &Secret, desired: &Secret) -> bool {
    let stored = existing
        .data
        .as_ref()
        .and_then(|data| data.get(SECRET_PAYLOAD_KEY))
        .map(|value| value.0.as_slice());
    let wanted = desired
        .string_data
        .as_ref()
        .and_then(|data| data.get(SECRET_PAYLOAD_KEY))
        .map(String::as_bytes);

    stored.is_some()
        && stored == wanted
        && existing.metadata.owner_references == desired.metadata.owner_references
}

/// Error policy for the identity reconciler
pub fn error_policy(
    service_account: Arc<ServiceAccount>,
    error: &Error,
    _ctx: Arc<IdentityContext>,
) -> Action {
    error!(
        ?error,
        service_account = %service_account.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(RESYNC_INTERVAL)
    }
}
