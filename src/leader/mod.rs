//! Leader election using Kubernetes Leases
//!
//! One pilot per cluster may perform leader-only duties (e.g. publishing
//! cluster-scoped events). Election uses the coordination.k8s.io/v1 Lease
//! API with resourceVersion compare-and-swap semantics: if the lease
//! changes between read and write the update fails with 409 Conflict and
//! the loop retries, so two pilots can never both believe they won.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Error;

/// Default time a lease is valid without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default interval between renewals by the holder
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between acquisition attempts by non-holders
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

const FIELD_MANAGER: &str = "navigator-pilot";

/// Leader elector backed by a Kubernetes Lease
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
    /// Create an elector with default timing (15s lease, 10s renew, 2s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the lease duration
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Override the renewal interval
    pub fn renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Override the acquisition retry interval
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Whether this elector currently believes it holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Shared flag usable by probes and leader-only code paths
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    /// Block until leadership is acquired, then return a guard.
    ///
    /// The guard maintains leadership through periodic renewal; when it is
    /// dropped or leadership is lost, the lost channel signals.
    pub async fn acquire(self: Arc<Self>) -> crate::Result<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership"
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
                        "Lease held by another pilot, waiting"
                    );
                }
                Err(e) => {
                    // Transient API errors must not stop the candidate.
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying"
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

    /// Try to acquire or renew the lease atomically.
    ///
    /// Reads the lease with its resourceVersion, decides, then writes with
    /// the same resourceVersion so a concurrent change fails the write.
    async fn try_acquire_or_renew(&self) -> crate::Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => self.create_lease(&api, now).await,
            Some(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_ref());
                let resource_version = lease.metadata.resource_version.clone();

                if holder == Some(&self.identity) {
                    return self.renew_lease(&api, &lease, now).await;
                }

                if lease_expired(spec, now) {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&api, resource_version, now, transitions)
                        .await
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> crate::Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                // Another pilot created it first; not an error.
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
    ) -> crate::Result<bool> {
        let resource_version = existing
            .metadata
            .resource_version
            .as_ref()
            .ok_or_else(|| Error::validation("lease missing resourceVersion"))?;

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }
        updated.metadata.resource_version = Some(resource_version.clone());

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(identity = %self.identity, "Lease renewal conflict, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        resource_version: Option<String>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> crate::Result<bool> {
        let rv = resource_version
            .ok_or_else(|| Error::validation("lease missing resourceVersion"))?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions + 1),
                ..Default::default()
            }),
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew periodically; a failed renewal is retried every
    /// `retry_interval` while the lease we last wrote is still valid, so
    /// one transient API error does not forfeit leadership.
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut valid_until = tokio::time::Instant::now() + self.lease_duration;
        tokio::time::sleep(self.renew_interval).await;

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    valid_until = tokio::time::Instant::now() + self.lease_duration;
                    tokio::time::sleep(self.renew_interval).await;
                }
                Ok(false) | Err(_) if tokio::time::Instant::now() < valid_until => {
                    warn!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease renewal failed, retrying while the lease is valid"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Release the lease by clearing the holder identity so a standby can
    /// acquire it immediately instead of waiting out the lease duration.
    async fn release_lease(&self) -> crate::Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(identity = %self.identity, "Lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Push renew_time into the past so the lease is immediately stale.
        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        // force() is only valid with Patch::Apply; a plain merge patch
        // suffices to blank the holder.
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&self.lease_name, &params, &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

/// Whether a lease is past its renewal deadline.
///
/// A lease without a renew time or duration is treated as expired so a
/// malformed lease can always be taken over.
fn lease_expired(spec: Option<&LeaseSpec>, now: chrono::DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Guard held while this pilot is the leader.
///
/// Dropping the guard aborts renewal; `lost()` resolves when the lease is
/// lost to another holder.
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

    /// Release the lease during graceful shutdown
    pub async fn release_leadership(&self) -> crate::Result<()> {
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

    fn spec(renew_ago_secs: i64, duration_secs: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other-0".to_string()),
            lease_duration_seconds: Some(duration_secs),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renew_ago_secs),
            )),
            ..Default::default()
        }
    }

    fn elector() -> LeaderElector {
        let config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        LeaderElector::new(client, "navigator-leader", "db", "cass-0")
    }

    #[test]
    fn freshly_renewed_lease_is_not_expired() {
        assert!(!lease_expired(Some(&spec(5, 15)), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_expired(Some(&spec(30, 15)), Utc::now()));
    }

    #[test]
    fn lease_without_renew_time_or_duration_is_expired() {
        assert!(lease_expired(None, Utc::now()));
        assert!(lease_expired(
            Some(&LeaseSpec {
                holder_identity: Some("other-0".to_string()),
                ..Default::default()
            }),
            Utc::now()
        ));
    }

    #[test]
    fn expiry_boundary_requires_the_deadline_to_pass() {
        let s = spec(15, 15);
        let renew = s.renew_time.as_ref().unwrap().0;
        // Exactly at renew_time + duration the lease still holds.
        assert!(!lease_expired(Some(&s), renew + chrono::Duration::seconds(15)));
        assert!(lease_expired(
            Some(&s),
            renew + chrono::Duration::seconds(16)
        ));
    }

    #[tokio::test]
    async fn timing_defaults_and_overrides() {
        let e = elector();
        assert_eq!(e.lease_duration, DEFAULT_LEASE_DURATION);
        assert_eq!(e.renew_interval, DEFAULT_RENEW_INTERVAL);
        assert_eq!(e.retry_interval, DEFAULT_RETRY_INTERVAL);

        let e = elector()
            .lease_duration(Duration::from_secs(30))
            .renew_interval(Duration::from_secs(20))
            .retry_interval(Duration::from_secs(5));
        assert_eq!(e.lease_duration, Duration::from_secs(30));
        assert_eq!(e.renew_interval, Duration::from_secs(20));
        assert_eq!(e.retry_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn guard_drop_clears_the_leader_flag_and_stops_renewal() {
        let elector = Arc::new(elector());
        elector.is_leader.store(true, Ordering::SeqCst);

        let guard = elector.create_guard();
        assert!(elector.is_leader());

        drop(guard);
        assert!(!elector.is_leader());
    }
}
