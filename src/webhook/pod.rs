//! Pod credential injection
//!
//! For every Pod created with the workload identity label and a
//! ServiceAccount, adds a projected volume
//! holding a short-lived token with the workload identity pool as audience
//! plus the ServiceAccount's credential-config, mounts it into every
//! container and points `GOOGLE_APPLICATION_CREDENTIALS` at the config.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use super::patch::PatchBuilder;
use super::{WebhookError, WebhookState};
use crate::federation::record::membership_from_secret;
use crate::federation::Membership;
use crate::{
    credential_secret_name, Error, CREDENTIAL_FILE_NAME, CREDENTIAL_MOUNT_PATH,
    LABEL_WORKLOAD_IDENTITY, LABEL_WORKLOAD_IDENTITY_ENABLED, MEMBERSHIP_SECRET_NAME,
    SECRET_PAYLOAD_KEY, TOKEN_FILE_NAME,
};

/// Name of the injected projected volume
pub const VOLUME_NAME: &str = "workload-identity-credentials";

/// Environment variable read by Google client libraries
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Lifetime of the projected token; the kubelet rotates it before expiry
pub const TOKEN_EXPIRATION_SECONDS: i64 = 7200;

/// File mode of the projected volume (0644)
pub const VOLUME_DEFAULT_MODE: i32 = 420;

/// Default admission deadline
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// How the webhook treats a Pod whose ServiceAccount does not exist
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum IdentityPolicy {
    /// Inject without checking the ServiceAccount
    #[default]
    TrustReference,
    /// Deny Pods referencing a ServiceAccount that does not exist
    RequireIdentity,
}

/// Reads the webhook needs at admission time
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// The membership record of this cluster, `None` when not written yet
    async fn federation_membership(&self) -> Result<Option<Membership>, Error>;

    /// Whether a ServiceAccount exists
    async fn identity_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// [`AdmissionStore`] backed by the kube API
pub struct KubeAdmissionStore {
    client: Client,
    membership_namespace: String,
}

impl KubeAdmissionStore {
    /// Create a store reading the membership secret from `membership_namespace`
    pub fn new(client: Client, membership_namespace: impl Into<String>) -> Self {
        Self {
            client,
            membership_namespace: membership_namespace.into(),
        }
    }
}

#[async_trait]
impl AdmissionStore for KubeAdmissionStore {
    async fn federation_membership(&self) -> Result<Option<Membership>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.membership_namespace);
        match api.get_opt(MEMBERSHIP_SECRET_NAME).await? {
            Some(secret) => Ok(Some(membership_from_secret(&secret)?)),
            None => Ok(None),
        }
    }

    async fn identity_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }
}

/// Outcome of evaluating one admission request
#[derive(Debug)]
pub enum Decision {
    /// Admit, optionally with a patch
    Allow(Option<json_patch::Patch>),
    /// Reject with an HTTP-style status code
    Deny {
        /// 4xx for problems with the request, 5xx for our own failures
        code: u16,
        /// Reason shown to the client
        message: String,
    },
}

impl Decision {
    fn deny(code: u16, message: impl Into<String>) -> Self {
        Self::Deny {
            code,
            message: message.into(),
        }
    }

    /// Turn the decision into a response for `request`
    pub fn into_response(self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        match self {
            Decision::Allow(None) => AdmissionResponse::from(request),
            Decision::Allow(Some(patch)) => match AdmissionResponse::from(request).with_patch(patch)
            {
                Ok(response) => response,
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "failed to serialize patch");
                    denied(request, 500, format!("patch serialization error: {e}"))
                }
            },
            Decision::Deny { code, message } => denied(request, code, message),
        }
    }
}

fn denied(request: &AdmissionRequest<DynamicObject>, code: u16, message: String) -> AdmissionResponse {
    let mut response = AdmissionResponse::from(request).deny(message);
    response.result.code = code;
    response
}

/// Mutates Pods at creation time
pub struct CredentialInjector {
    store: Arc<dyn AdmissionStore>,
    policy: IdentityPolicy,
    timeout: Duration,
}

impl CredentialInjector {
    /// Create an injector with the default deadline
    pub fn new(store: Arc<dyn AdmissionStore>, policy: IdentityPolicy) -> Self {
        Self {
            store,
            policy,
            timeout: DEFAULT_ADMISSION_TIMEOUT,
        }
    }

    /// Override the admission deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Answer an admission request, denying with 500 when the deadline passes
    pub async fn admit(&self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let decision = match tokio::time::timeout(self.timeout, self.decide(request)).await {
            Ok(decision) => decision,
            Err(_) => {
                warn!(uid = %request.uid, timeout = ?self.timeout, "admission deadline exceeded");
                Decision::deny(500, "admission deadline exceeded")
            }
        };
        decision.into_response(request)
    }

    /// Evaluate a request without a deadline
    pub async fn decide(&self, request: &AdmissionRequest<DynamicObject>) -> Decision {
        let uid = &request.uid;

        if !matches!(request.operation, Operation::Create) {
            debug!(uid = %uid, operation = ?request.operation, "not a create, allowing unchanged");
            return Decision::Allow(None);
        }

        let pod = match decode_pod(request) {
            Ok(pod) => pod,
            Err(message) => {
                warn!(uid = %uid, %message, "rejecting undecodable pod");
                return Decision::deny(400, message);
            }
        };

        if !opted_in(&pod) {
            debug!(uid = %uid, pod = %pod.name_any(), "pod not labelled for workload identity");
            return Decision::Allow(None);
        }

        let Some(service_account) = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .filter(|name| !name.is_empty())
        else {
            return Decision::deny(400, "pod has no service account name");
        };

        let namespace = request
            .namespace
            .clone()
            .or_else(|| pod.metadata.namespace.clone())
            .unwrap_or_default();

        if self.policy == IdentityPolicy::RequireIdentity {
            match self.store.identity_exists(&namespace, &service_account).await {
                Ok(true) => {}
                Ok(false) => {
                    return Decision::deny(
                        400,
                        format!("service account {namespace}/{service_account} not found"),
                    )
                }
                Err(e) => {
                    error!(uid = %uid, error = %e, "failed to look up service account");
                    return Decision::deny(500, format!("failed to look up service account: {e}"));
                }
            }
        }

        let membership = match self.store.federation_membership().await {
            Ok(Some(membership)) if !membership.authority.workload_identity_pool.is_empty() => {
                membership
            }
            Ok(Some(_)) => {
                return Decision::deny(500, "federation membership has no workload identity pool")
            }
            Ok(None) => return Decision::deny(500, "federation membership not found"),
            Err(e) => {
                error!(uid = %uid, error = %e, "failed to read federation membership");
                return Decision::deny(500, format!("failed to read federation membership: {e}"));
            }
        };

        let patch = credential_patch(
            &pod,
            &membership.authority.workload_identity_pool,
            &credential_secret_name(&service_account),
        );

        info!(
            uid = %uid,
            service_account = %service_account,
            patch_ops = patch.0.len(),
            "injecting workload identity credentials"
        );
        Decision::Allow(Some(patch))
    }
}

/// Whether the Pod carries the workload identity opt-in label
pub fn opted_in(pod: &Pod) -> bool {
    pod.labels()
        .get(LABEL_WORKLOAD_IDENTITY)
        .is_some_and(|value| value == LABEL_WORKLOAD_IDENTITY_ENABLED)
}

fn decode_pod(request: &AdmissionRequest<DynamicObject>) -> Result<Pod, String> {
    let object = request
        .object
        .as_ref()
        .ok_or_else(|| "admission request carries no object".to_string())?;
    let value = serde_json::to_value(object).map_err(|e| format!("invalid pod: {e}"))?;
    serde_json::from_value(value).map_err(|e| format!("invalid pod: {e}"))
}

/// Volume projecting the token and the credential-config
fn credential_volume(audience: &str, secret_name: &str) -> Value {
    json!({
        "name": VOLUME_NAME,
        "projected": {
            "defaultMode": VOLUME_DEFAULT_MODE,
            "sources": [
                {
                    "serviceAccountToken": {
                        "audience": audience,
                        "expirationSeconds": TOKEN_EXPIRATION_SECONDS,
                        "path": TOKEN_FILE_NAME,
                    }
                },
                {
                    "secret": {
                        "name": secret_name,
                        "items": [{"key": SECRET_PAYLOAD_KEY, "path": CREDENTIAL_FILE_NAME}],
                    }
                }
            ]
        }
    })
}

/// Patch adding the credential volume and, per container, the env var and mount
pub fn credential_patch(pod: &Pod, audience: &str, secret_name: &str) -> json_patch::Patch {
    let mut builder = PatchBuilder::new();
    let Some(spec) = pod.spec.as_ref() else {
        return builder.build();
    };

    builder.append(
        &["spec", "volumes"],
        spec.volumes.as_ref().map(Vec::len),
        credential_volume(audience, secret_name),
    );

    for (i, container) in spec.containers.iter().enumerate() {
        let index = i.to_string();
        builder.append(
            &["spec", "containers", &index, "env"],
            container.env.as_ref().map(Vec::len),
            json!({
                "name": CREDENTIALS_ENV,
                "value": format!("{CREDENTIAL_MOUNT_PATH}/{CREDENTIAL_FILE_NAME}"),
            }),
        );
        builder.append(
            &["spec", "containers", &index, "volumeMounts"],
            container.volume_mounts.as_ref().map(Vec::len),
            json!({
                "name": VOLUME_NAME,
                "mountPath": CREDENTIAL_MOUNT_PATH,
                "readOnly": true,
            }),
        );
    }

    builder.build()
}

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    body: Result<Json<AdmissionReview<DynamicObject>>, JsonRejection>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let Json(review) = body.map_err(|e| WebhookError::InvalidReview(e.body_text()))?;

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Ok(Json(AdmissionResponse::invalid(e.to_string()).into_review()));
        }
    };

    let response = state.injector.admit(&request).await;
    Ok(Json(response.into_review()))
}
