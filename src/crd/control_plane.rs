//! KubeadmControlPlane view (controlplane.cluster.x-k8s.io/v1beta1)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a KubeadmControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "KubeadmControlPlane",
    plural = "kubeadmcontrolplanes",
    status = "KubeadmControlPlaneStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneSpec {
    /// Desired number of control plane machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Kubernetes version of the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Observed state of a KubeadmControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmControlPlaneStatus {
    /// The API server is reachable
    #[serde(default)]
    pub ready: bool,

    /// The first control plane machine finished kubeadm init
    #[serde(default)]
    pub initialized: bool,
}

impl KubeadmControlPlane {
    /// Control plane readiness, false until the status is populated
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}
