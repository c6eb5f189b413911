//! Reconcilers
//!
//! - [`cluster`] gates GCPClusters on the management cluster and federates them
//! - [`identity`] turns annotated ServiceAccounts into credential secrets
//! - [`runner`] wires both into `kube::runtime::Controller`

pub mod cluster;
pub mod identity;
pub mod runner;

pub use cluster::{Context, ContextBuilder};
pub use identity::IdentityContext;
pub use runner::{build_cluster_controller, build_identity_controller, ControllerFuture};
