//! Workload identity federation for Cluster API managed GCP clusters
//!
//! The operator connects three stages into a single pipeline:
//!
//! 1. On the management cluster, every `GCPCluster` annotated for workload
//!    identity is registered as a GKE Hub membership, and the resulting
//!    membership record is written into the workload cluster as a secret.
//! 2. On the workload cluster, every `ServiceAccount` annotated with a GCP
//!    service account gets a credential-config secret derived from that
//!    membership record.
//! 3. A mutating admission webhook injects the credential-config, a projected
//!    service account token and `GOOGLE_APPLICATION_CREDENTIALS` into new Pods
//!    labelled `giantswarm.io/gcp-workload-identity: enabled`.
//!
//! # Modules
//!
//! - [`crd`] - Typed views over the Cluster API resources that are read
//! - [`federation`] - GKE Hub client, membership derivation and persisted records
//! - [`controller`] - Cluster gate and identity reconcilers
//! - [`webhook`] - Pod mutation webhook
//! - [`leader_election`] - Lease based leader election
//! - [`probe`] - Liveness and readiness endpoints
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod federation;
pub mod leader_election;
pub mod probe;
pub mod telemetry;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Object Layout
// =============================================================================
// Names, keys and annotations written to or read from the cluster. These are
// part of the persisted layout and must stay stable across releases.

/// Value of the managed-by annotation and field manager for API writes
pub const MANAGED_BY: &str = "workload-identity-operator-gcp";

/// Annotation recording which component manages an object
pub const ANNOTATION_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Annotation recording the cluster a membership secret was created for
pub const ANNOTATION_CREATED_BY: &str = "app.kubernetes.io/created-by";

/// Presence of this annotation on a GCPCluster enables workload identity
pub const ANNOTATION_WORKLOAD_IDENTITY_ENABLED: &str = "giantswarm.io/workload-identity-enabled";

/// ServiceAccount annotation carrying the GCP service account email
pub const ANNOTATION_GCP_SERVICE_ACCOUNT: &str = "giantswarm.io/gcp-service-account";

/// Pod label opting the Pod into credential injection
pub const LABEL_WORKLOAD_IDENTITY: &str = "giantswarm.io/gcp-workload-identity";

/// Value of [`LABEL_WORKLOAD_IDENTITY`] that enables injection
pub const LABEL_WORKLOAD_IDENTITY_ENABLED: &str = "enabled";

/// Annotation linking a credential secret back to its ServiceAccount
pub const ANNOTATION_SERVICE_ACCOUNT_NAME: &str = "kubernetes.io/service-account.name";

/// Name of the singleton secret holding the membership record
pub const MEMBERSHIP_SECRET_NAME: &str = "workload-identity-operator-gcp-membership";

/// Default namespace of the membership secret
pub const DEFAULT_MEMBERSHIP_SECRET_NAMESPACE: &str = "giantswarm";

/// Key under which both the membership and credential secrets store their JSON payload
pub const SECRET_PAYLOAD_KEY: &str = "config";

/// Suffix appended to a ServiceAccount name to form its credential secret name
pub const CREDENTIAL_SECRET_SUFFIX: &str = "google-application-credentials";

/// Directory where the credential volume is mounted in every container
pub const CREDENTIAL_MOUNT_PATH: &str = "/var/run/secrets/workload-identity";

/// File name of the projected service account token inside the mount
pub const TOKEN_FILE_NAME: &str = "token";

/// File name of the credential-config JSON inside the mount
pub const CREDENTIAL_FILE_NAME: &str = "google-application-credentials.json";

/// Default port for the admission webhook HTTPS server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Name of the credential secret for a ServiceAccount
pub fn credential_secret_name(service_account: &str) -> String {
    format!("{service_account}-{CREDENTIAL_SECRET_SUFFIX}")
}

/// Finalizer protecting the membership secret from deletion
pub fn membership_secret_finalizer() -> String {
    format!("{MANAGED_BY}/finalizer")
}
