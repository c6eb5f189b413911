//! GCPCluster view (infrastructure.cluster.x-k8s.io/v1beta1)

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ANNOTATION_WORKLOAD_IDENTITY_ENABLED;

/// Specification of a GCPCluster
///
/// Only `project` matters for federation: the membership name, workload
/// identity pool and identity provider are all derived from it.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "GCPCluster",
    plural = "gcpclusters",
    status = "GCPClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GCPClusterSpec {
    /// GCP project the cluster runs in
    #[serde(default)]
    pub project: String,

    /// GCP region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Observed state of a GCPCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GCPClusterStatus {
    /// Infrastructure is provisioned
    #[serde(default)]
    pub ready: bool,
}

impl GCPCluster {
    /// Workload identity is opted in through an annotation; its value is ignored
    pub fn workload_identity_enabled(&self) -> bool {
        self.annotations()
            .contains_key(ANNOTATION_WORKLOAD_IDENTITY_ENABLED)
    }

    /// Infrastructure readiness as reported by the GCP provider
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}
