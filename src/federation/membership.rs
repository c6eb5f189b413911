//! Membership derivation and registration
//!
//! Everything about a membership except the correlation id and the key set
//! is a pure function of `(project, cluster name)`. Registering the same
//! cluster twice therefore describes the same membership, which is what makes
//! treating a conflict as success safe.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{Authority, FederationClient, Membership, AUTHORITY_ISSUER};
use crate::crd::GCPCluster;
use crate::Error;

/// Suffix appended to the cluster name to form the membership id
pub const MEMBERSHIP_ID_SUFFIX: &str = "workload-identity-test";

/// Identity of a cluster as far as federation is concerned
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterIdentity {
    /// Cluster name
    pub name: String,
    /// GCP project the cluster runs in
    pub project: String,
}

impl ClusterIdentity {
    /// Create a cluster identity
    pub fn new(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
        }
    }

    /// Extract the identity from a GCPCluster, rejecting clusters without a project
    pub fn from_cluster(cluster: &GCPCluster) -> Result<Self, Error> {
        let name = cluster.name_any();
        if cluster.spec.project.is_empty() {
            return Err(Error::configuration(format!(
                "GCPCluster {name} has no spec.project"
            )));
        }
        Ok(Self::new(name, cluster.spec.project.clone()))
    }

    /// Membership id, unique per cluster within the project
    pub fn membership_id(&self) -> String {
        format!("{}-{}", self.name, MEMBERSHIP_ID_SUFFIX)
    }

    /// Parent location under which memberships are created
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/global", self.project)
    }

    /// Full membership resource name
    pub fn membership_name(&self) -> String {
        format!("{}/memberships/{}", self.parent(), self.membership_id())
    }

    /// Workload identity pool of the project
    pub fn workload_identity_pool(&self) -> String {
        format!("{}.svc.id.goog", self.project)
    }

    /// Identity provider URL registered for the membership
    pub fn identity_provider(&self) -> String {
        format!("https://gkehub.googleapis.com/{}", self.membership_name())
    }

    /// Build the membership for this cluster with a fresh correlation id
    pub fn membership(&self, oidc_jwks: Vec<u8>) -> Membership {
        Membership {
            name: self.membership_name(),
            authority: Authority {
                issuer: AUTHORITY_ISSUER.to_string(),
                workload_identity_pool: self.workload_identity_pool(),
                identity_provider: self.identity_provider(),
                oidc_jwks,
            },
            external_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Drives a [`FederationClient`] so a cluster's membership exists
#[derive(Clone)]
pub struct MembershipReconciler {
    client: Arc<dyn FederationClient>,
}

impl MembershipReconciler {
    /// Create a reconciler over the given federation client
    pub fn new(client: Arc<dyn FederationClient>) -> Self {
        Self { client }
    }

    /// Make sure a membership for the cluster is registered
    ///
    /// Returns the membership that was submitted. When GKE Hub reports a
    /// conflict the membership already exists; the stored correlation id is
    /// then read back and adopted, falling back to this attempt's id when the
    /// lookup fails.
    #[instrument(skip(self, oidc_jwks), fields(cluster = %cluster.name, project = %cluster.project))]
    pub async fn reconcile(
        &self,
        cluster: &ClusterIdentity,
        oidc_jwks: Vec<u8>,
    ) -> Result<Membership, Error> {
        let mut membership = cluster.membership(oidc_jwks);

        match self.client.register(cluster, &membership).await {
            Ok(()) => {
                info!(membership = %membership.name, "membership registered");
                Ok(membership)
            }
            Err(e) if e.is_conflict() => {
                if let Some(external_id) = self.stored_external_id(&membership.name).await {
                    membership.external_id = external_id;
                }
                info!(
                    membership = %membership.name,
                    external_id = %membership.external_id,
                    "membership already exists"
                );
                Ok(membership)
            }
            Err(e) => Err(e),
        }
    }

    async fn stored_external_id(&self, name: &str) -> Option<String> {
        match self.client.get(name).await {
            Ok(Some(stored)) if !stored.external_id.is_empty() => Some(stored.external_id),
            Ok(_) => None,
            Err(e) => {
                warn!(membership = %name, error = %e, "failed to read existing membership");
                None
            }
        }
    }
}
