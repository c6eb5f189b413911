//! Typed views over Cluster API resources
//!
//! These resources are owned by Cluster API and its GCP provider. Only the
//! fields this operator reads are modelled; everything else is ignored on
//! deserialization.

mod control_plane;
mod gcp_cluster;

pub use control_plane::{KubeadmControlPlane, KubeadmControlPlaneSpec, KubeadmControlPlaneStatus};
pub use gcp_cluster::{GCPCluster, GCPClusterSpec, GCPClusterStatus};
