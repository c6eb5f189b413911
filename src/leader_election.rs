//! Leader election using Kubernetes Leases
//!
//! Replicas compete for a coordination.k8s.io/v1 Lease; only the holder runs
//! controllers. Writes carry the lease's resourceVersion, so when two
//! replicas race for an expired lease one of them gets 409 Conflict and
//! keeps waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::MANAGED_BY;

/// Lease name shared by all replicas
pub const LEADER_LEASE_NAME: &str = "fleet-membership-operator.giantswarm.io";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease read from the API server has no resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What this replica may do with the lease it just read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseClaim {
    /// No lease exists yet
    Create,
    /// We hold it; refresh renewTime
    Renew,
    /// Held by someone else but expired; take it over
    TakeOver {
        /// Transition count to record
        transitions: i32,
    },
    /// Held by someone else and still valid
    HeldByOther,
}

/// Decide how to claim a lease given its current spec
pub fn lease_claim(
    spec: Option<&LeaseSpec>,
    exists: bool,
    identity: &str,
    now: DateTime<Utc>,
) -> LeaseClaim {
    if !exists {
        return LeaseClaim::Create;
    }

    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseClaim::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (_, Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    };

    if expired {
        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseClaim::TakeOver {
            transitions: transitions + 1,
        }
    } else {
        LeaseClaim::HeldByOther
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard renews the lease in the background; [`LeaderGuard::lost`]
    /// resolves when a renewal fails.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    fn desired_lease(
        &self,
        now: DateTime<Utc>,
        transitions: i32,
        resource_version: Option<String>,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await?;

        let claim = lease_claim(
            existing.as_ref().and_then(|l| l.spec.as_ref()),
            existing.is_some(),
            &self.identity,
            now,
        );

        let (lease, create) = match (claim, existing) {
            (LeaseClaim::HeldByOther, _) => return Ok(false),
            (LeaseClaim::Create, _) | (_, None) => (self.desired_lease(now, 0, None), true),
            (LeaseClaim::Renew, Some(mut lease)) => {
                self.require_resource_version(&lease)?;
                if let Some(ref mut spec) = lease.spec {
                    spec.renew_time = Some(MicroTime(now));
                }
                (lease, false)
            }
            (LeaseClaim::TakeOver { transitions }, Some(lease)) => {
                let rv = self.require_resource_version(&lease)?;
                (self.desired_lease(now, transitions, Some(rv)), false)
            }
        };

        let result = if create {
            api.create(&PostParams::default(), &lease).await.map(|_| ())
        } else {
            api.replace(&self.lease_name, &PostParams::default(), &lease)
                .await
                .map(|_| ())
        };

        match result {
            Ok(()) => {
                debug!(identity = %self.identity, ?claim, "Lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, ?claim, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn require_resource_version(&self, lease: &Lease) -> Result<String, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        let params = PatchParams {
            field_manager: Some(MANAGED_BY.to_string()),
            ..Default::default()
        };
        api.patch(&self.lease_name, &params, &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership by clearing the lease holder; call during shutdown
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_api, not_found};
    use http::{Method, StatusCode};
    use serde_json::Value;

    fn spec(holder: Option<&str>, renewed_secs_ago: i64, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(30),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    // ==========================================================================
    // Story Tests: Competing Replicas
    // ==========================================================================

    /// Story: the first replica to start finds no lease and creates it.
    #[test]
    fn story_first_replica_creates_lease() {
        assert_eq!(
            lease_claim(None, false, "pod-a", Utc::now()),
            LeaseClaim::Create
        );
    }

    /// Story: the holder keeps renewing its own lease.
    #[test]
    fn story_holder_renews() {
        let spec = spec(Some("pod-a"), 5, 0);
        assert_eq!(
            lease_claim(Some(&spec), true, "pod-a", Utc::now()),
            LeaseClaim::Renew
        );
    }

    /// Story: a standby sees a fresh lease held by the leader and waits.
    #[test]
    fn story_standby_waits_for_valid_lease() {
        let spec = spec(Some("pod-a"), 5, 0);
        assert_eq!(
            lease_claim(Some(&spec), true, "pod-b", Utc::now()),
            LeaseClaim::HeldByOther
        );
    }

    /// Story: the leader crashed and stopped renewing; after the lease
    /// duration the standby takes over and bumps the transition count.
    #[test]
    fn story_standby_takes_over_expired_lease() {
        let spec = spec(Some("pod-a"), 45, 2);
        assert_eq!(
            lease_claim(Some(&spec), true, "pod-b", Utc::now()),
            LeaseClaim::TakeOver { transitions: 3 }
        );
    }

    /// Story: a released lease has no holder and is immediately claimable.
    #[test]
    fn story_released_lease_is_claimable() {
        let spec = spec(None, 0, 1);
        assert_eq!(
            lease_claim(Some(&spec), true, "pod-b", Utc::now()),
            LeaseClaim::TakeOver { transitions: 2 }
        );
    }

    fn lease_json(holder: Option<&str>) -> Value {
        json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": LEADER_LEASE_NAME,
                "namespace": "giantswarm",
                "resourceVersion": "7",
            },
            "spec": {
                "holderIdentity": holder,
                "leaseDurationSeconds": 30,
                "renewTime": "2026-10-16T10:00:00.000000Z",
            },
        })
    }

    const LEASE_PATH: &str =
        "/apis/coordination.k8s.io/v1/namespaces/giantswarm/leases/fleet-membership-operator.giantswarm.io";

    // ==========================================================================
    // Story Tests: Lease Writes
    // ==========================================================================

    /// Story: the leader shuts down and clears the holder with a merge patch
    /// so a standby can take over at once.
    #[tokio::test]
    async fn story_release_patches_the_lease() {
        let (client, log) = fake_api(|_, _| (StatusCode::OK, lease_json(Some("pod-a"))));
        let elector = LeaderElector::new(client, LEADER_LEASE_NAME, "giantswarm", "pod-a");

        elector.release_lease().await.expect("release should succeed");

        let requests = log.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, Method::GET);
        assert_eq!(requests[1].method, Method::PATCH);
        assert_eq!(requests[1].path, LEASE_PATH);
        assert_eq!(
            requests[1].content_type.as_deref(),
            Some("application/merge-patch+json")
        );
    }

    /// Story: a replica that lost the lease in the meantime leaves the new
    /// holder alone on shutdown.
    #[tokio::test]
    async fn story_release_skips_lease_held_by_other() {
        let (client, log) = fake_api(|_, _| (StatusCode::OK, lease_json(Some("pod-b"))));
        let elector = LeaderElector::new(client, LEADER_LEASE_NAME, "giantswarm", "pod-a");

        elector.release_lease().await.unwrap();

        assert_eq!(log.calls(), vec![(Method::GET, LEASE_PATH.to_string())]);
    }

    /// Story: the first replica finds no lease and creates it.
    #[tokio::test]
    async fn story_missing_lease_is_created() {
        let (client, log) = fake_api(|method, _| {
            if method == Method::GET {
                not_found(LEADER_LEASE_NAME)
            } else {
                (StatusCode::CREATED, lease_json(Some("pod-a")))
            }
        });
        let elector = LeaderElector::new(client, LEADER_LEASE_NAME, "giantswarm", "pod-a");

        assert!(elector.try_acquire_or_renew().await.unwrap());

        let calls = log.calls();
        assert_eq!(calls[1].0, Method::POST);
        assert_eq!(
            calls[1].1,
            "/apis/coordination.k8s.io/v1/namespaces/giantswarm/leases"
        );
    }

    /// Story: two replicas race for the lease; the loser's write conflicts
    /// and it keeps waiting instead of failing.
    #[tokio::test]
    async fn story_write_conflict_means_not_leader() {
        let (client, _) = fake_api(|method, _| {
            if method == Method::GET {
                (StatusCode::OK, lease_json(None))
            } else {
                (
                    StatusCode::CONFLICT,
                    json!({
                        "kind": "Status",
                        "apiVersion": "v1",
                        "metadata": {},
                        "status": "Failure",
                        "message": "the object has been modified",
                        "reason": "Conflict",
                        "code": 409,
                    }),
                )
            }
        });
        let elector = LeaderElector::new(client, LEADER_LEASE_NAME, "giantswarm", "pod-b");

        assert!(!elector.try_acquire_or_renew().await.unwrap());
    }

    #[test]
    fn lease_without_timing_counts_as_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("pod-a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            lease_claim(Some(&spec), true, "pod-b", Utc::now()),
            LeaseClaim::TakeOver { transitions: 1 }
        );
    }
}
