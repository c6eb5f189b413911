//! Federation with GKE Hub
//!
//! A cluster becomes part of a workload identity pool by registering a
//! membership whose authority points at the cluster's OIDC issuer and key
//! set. This module holds the membership model, the client port used to talk
//! to GKE Hub, and the records persisted in Kubernetes secrets:
//!
//! - [`membership`] - deterministic membership derivation and registration
//! - [`gkehub`] - REST implementation of [`FederationClient`]
//! - [`record`] - the membership secret written into workload clusters
//! - [`credentials`] - the per-ServiceAccount credential-config document

pub mod credentials;
pub mod gkehub;
pub mod membership;
pub mod record;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

pub use credentials::{CredentialConfig, CredentialSource};
pub use gkehub::{GkeHubClient, MetadataTokenSource, StaticTokenSource, TokenSource};
pub use membership::{ClusterIdentity, MembershipReconciler};

use crate::Error;

/// Issuer of service account tokens inside every workload cluster
pub const AUTHORITY_ISSUER: &str = "https://kubernetes.default.svc.cluster.local";

/// A GKE Hub membership
///
/// Serialized with the GKE Hub JSON field names. The same document is stored
/// in the membership secret and read back by the identity reconciler and the
/// webhook.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// Full resource name `projects/{p}/locations/global/memberships/{id}`
    #[serde(default)]
    pub name: String,

    /// OIDC authority binding the cluster to the workload identity pool
    #[serde(default)]
    pub authority: Authority,

    /// Opaque correlation id, regenerated for every registration attempt
    #[serde(default)]
    pub external_id: String,
}

/// Authority section of a membership
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authority {
    /// OIDC issuer URL of the cluster
    #[serde(default)]
    pub issuer: String,

    /// Workload identity pool, `{project}.svc.id.goog`
    #[serde(default)]
    pub workload_identity_pool: String,

    /// Identity provider URL for the membership
    #[serde(default)]
    pub identity_provider: String,

    /// Raw JSON Web Key Set of the cluster, base64 encoded on the wire
    #[serde(default, with = "base64_bytes")]
    pub oidc_jwks: Vec<u8>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Port to the federation service
///
/// Implementations return service errors verbatim. Interpreting a conflict
/// as "already registered" is left to [`MembershipReconciler`], and retries
/// are left to the controller requeue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FederationClient: Send + Sync {
    /// Create the membership and wait for the long-running operation to finish
    async fn register(&self, cluster: &ClusterIdentity, membership: &Membership)
        -> Result<(), Error>;

    /// Fetch a membership by its full resource name, `None` when absent
    async fn get(&self, name: &str) -> Result<Option<Membership>, Error>;
}
