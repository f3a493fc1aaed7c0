//! Pilot reconciliation
//!
//! The reconciler drains a deduplicating work queue of Pilot keys fed by
//! watch events and scheduled resyncs. For each key it determines whether
//! the Pilot is "this" pilot (the one this sidecar manages) or a peer
//! (same controlling owner, different pod):
//!
//! - peers get only the database-specific sync callback, never hooks,
//!   process management or status writes
//! - "this" pilot gets the full sequence: PreStart hooks, process
//!   construction and start, PostStart hooks, domain sync, and always
//!   exactly one status update, with sync and status errors aggregated
//!
//! A single worker drains the queue so process management is strictly
//! sequential; producers add keys concurrently.

mod queue;
mod resync;

pub use queue::WorkQueue;
pub use resync::ScheduledResync;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, PostParams};
use kube::runtime::reflector::store::Store;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    controller_ref, same_controller, Pilot, PilotCondition, PilotConditionStatus, PilotPhase,
    PilotStatus,
};
use crate::events::{actions, reasons, EventPublisher};
use crate::hook::Hooks;
use crate::process::{CommandDescriptor, Process, SignalMap};
use crate::Error;

/// Attempts made to write status before giving up on conflicts
const STATUS_UPDATE_ATTEMPTS: u32 = 5;

/// Trait abstracting read/write access to Pilot resources.
///
/// Reads come from the local watch cache; writes go to the API server.
/// The trait exists so the reconciler can be tested without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PilotClient: Send + Sync {
    /// Fetch a Pilot from the local cache. None when not present.
    async fn get(&self, namespace: &str, name: &str) -> crate::Result<Option<Pilot>>;

    /// Write the Pilot's status subresource, retrying on conflict.
    /// Returns the Pilot as persisted by the API server.
    async fn update_status(&self, pilot: &Pilot) -> crate::Result<Pilot>;
}

/// Database-specific behaviour injected into the reconciler.
///
/// One implementation exists per supported database. Injection at
/// construction replaces any global registration of controllers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PilotStrategy: Send + Sync {
    /// Build the command used to launch the database process
    fn build_command(&self, pilot: &Pilot) -> CommandDescriptor;

    /// Reconcile database-specific observed state into the Pilot.
    ///
    /// Always receives an owned, mutation-safe copy; mutations are only
    /// persisted for "this" pilot.
    async fn sync(&self, pilot: &mut Pilot) -> crate::Result<()>;
}

/// Object key for a Pilot: `namespace/name`
pub fn object_key(pilot: &Pilot) -> Option<String> {
    let namespace = pilot.meta().namespace.as_deref()?;
    let name = pilot.meta().name.as_deref()?;
    Some(format!("{namespace}/{name}"))
}

fn split_key(key: &str) -> crate::Result<(&str, &str)> {
    key.split_once('/').ok_or_else(|| {
        Error::validation(format!("invalid object key {key:?}, expected namespace/name"))
    })
}

struct LocalState {
    cached_self: Option<Pilot>,
    process: Option<Process>,
    shutdown_requested: bool,
}

/// The generic pilot controller.
///
/// Owns the work queue, the hook engine and the process supervisor, and
/// dispatches database-specific work to the injected [`PilotStrategy`].
pub struct PilotReconciler {
    pilot_name: String,
    pilot_namespace: String,
    resync_period: Duration,
    signals: SignalMap,
    client: Arc<dyn PilotClient>,
    strategy: Arc<dyn PilotStrategy>,
    events: Arc<dyn EventPublisher>,
    hooks: Hooks,
    queue: Arc<WorkQueue>,
    resync: ScheduledResync,
    state: Mutex<LocalState>,
}

impl PilotReconciler {
    /// Create a reconciler for the pilot identified by namespace/name.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pilot_namespace: impl Into<String>,
        pilot_name: impl Into<String>,
        resync_period: Duration,
        signals: SignalMap,
        client: Arc<dyn PilotClient>,
        strategy: Arc<dyn PilotStrategy>,
        events: Arc<dyn EventPublisher>,
        hooks: Hooks,
        queue: Arc<WorkQueue>,
    ) -> Self {
        let resync = ScheduledResync::new(queue.clone());
        Self {
            pilot_name: pilot_name.into(),
            pilot_namespace: pilot_namespace.into(),
            resync_period,
            signals,
            client,
            strategy,
            events,
            hooks,
            queue,
            resync,
            state: Mutex::new(LocalState {
                cached_self: None,
                process: None,
                shutdown_requested: false,
            }),
        }
    }

    /// The work queue fed by watch events
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// The resync scheduler (exposed for observability and tests)
    pub fn resync(&self) -> &ScheduledResync {
        &self.resync
    }

    /// Whether the supervised database process is currently running
    pub async fn process_running(&self) -> bool {
        let mut state = self.state.lock().await;
        state
            .process
            .as_mut()
            .map(|p| p.running())
            .unwrap_or(false)
    }

    /// Run one sync cycle for an object key.
    pub async fn sync(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = split_key(key)?;
        let is_self = namespace == self.pilot_namespace && name == self.pilot_name;

        let fetched = match self.client.get(namespace, name).await? {
            Some(pilot) => pilot,
            None if !is_self => {
                // A deleted peer needs no work.
                debug!(key, "Peer pilot not found, nothing to do");
                return Ok(());
            }
            None => {
                // Our own Pilot is gone from the cache; fall back to the
                // last-known copy so the managed process keeps its config.
                let state = self.state.lock().await;
                match state.cached_self.clone() {
                    Some(pilot) => {
                        warn!(key, "Own pilot not found, using cached copy");
                        pilot
                    }
                    None => return Err(Error::PilotNotFound(key.to_string())),
                }
            }
        };

        let this = if is_self {
            fetched.clone()
        } else {
            self.this_pilot().await?
        };
        let this_owner = controller_ref(&this).cloned().ok_or_else(|| {
            Error::missing_owner(format!(
                "pilot {}/{} has no controlling owner reference",
                self.pilot_namespace, self.pilot_name
            ))
        })?;

        let Some(fetched_owner) = controller_ref(&fetched).cloned() else {
            // An unowned Pilot is not a peer; skip it silently.
            debug!(key, "Pilot has no owner reference, skipping");
            return Ok(());
        };
        if !same_controller(&this_owner, &fetched_owner) {
            debug!(key, "Pilot belongs to a different cluster, skipping");
            return Ok(());
        }

        if is_self {
            let mut state = self.state.lock().await;
            state.cached_self = Some(fetched.clone());
        }

        // Work on an owned copy; cache-owned objects are never mutated.
        let mut pilot = fetched.clone();

        // Schedule re-evaluation of this key no matter what happens below,
        // so peers keep being re-examined even absent new events.
        self.resync.add(key, self.resync_period);

        if is_self {
            self.sync_self(&mut pilot).await
        } else {
            self.strategy.sync(&mut pilot).await
        }
    }

    async fn this_pilot(&self) -> crate::Result<Pilot> {
        if let Some(pilot) = self.state.lock().await.cached_self.clone() {
            return Ok(pilot);
        }
        self.client
            .get(&self.pilot_namespace, &self.pilot_name)
            .await?
            .ok_or_else(|| {
                Error::missing_owner(format!(
                    "pilot {}/{} not found, cluster membership cannot be determined",
                    self.pilot_namespace, self.pilot_name
                ))
            })
    }

    async fn sync_self(&self, pilot: &mut Pilot) -> crate::Result<()> {
        let sync_result = self.sync_self_inner(pilot).await;

        // The status update always runs; its error must not mask a sync
        // error and vice versa.
        let status_result = self.write_status(pilot, &sync_result).await;

        let mut errors = Vec::new();
        if let Err(e) = sync_result {
            errors.push(e);
        }
        if let Err(e) = status_result {
            errors.push(e);
        }
        Error::aggregate(errors)
    }

    async fn sync_self_inner(&self, pilot: &mut Pilot) -> crate::Result<()> {
        self.transition(PilotPhase::PreStart, pilot).await?;
        self.ensure_process_running(pilot).await?;
        self.transition(PilotPhase::PostStart, pilot).await?;
        self.strategy.sync(pilot).await
    }

    /// Run a hook phase, recording completion in the Pilot's status and
    /// emitting a Warning event on failure.
    async fn transition(&self, phase: PilotPhase, pilot: &mut Pilot) -> crate::Result<()> {
        match self.hooks.transition(phase, pilot) {
            Ok(()) => {
                pilot
                    .status
                    .get_or_insert_with(PilotStatus::default)
                    .last_completed_phase = Some(phase);
                Ok(())
            }
            Err(e) => {
                self.events
                    .publish(
                        &pilot.object_ref(&()),
                        EventType::Warning,
                        reasons::HOOK_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn ensure_process_running(&self, pilot: &Pilot) -> crate::Result<()> {
        let started = {
            let mut state = self.state.lock().await;
            if state.process.is_none() {
                let descriptor = self.strategy.build_command(pilot);
                debug!(program = %descriptor.program, "Constructing process supervisor");
                state.process = Some(Process::new(descriptor, self.signals));
            }
            let shutdown_requested = state.shutdown_requested;
            match state.process.as_mut() {
                Some(process) => {
                    if !process.running() && !shutdown_requested {
                        process.start()?;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if started {
            self.events
                .publish(
                    &pilot.object_ref(&()),
                    EventType::Normal,
                    reasons::PROCESS_STARTED,
                    actions::RECONCILE,
                    Some("database process started".to_string()),
                )
                .await;
        }
        Ok(())
    }

    async fn write_status(
        &self,
        pilot: &mut Pilot,
        sync_result: &crate::Result<()>,
    ) -> crate::Result<()> {
        let running = self.process_running().await;
        let condition = match (running, sync_result) {
            (true, Ok(())) => PilotCondition::new(
                PilotCondition::STARTED,
                PilotConditionStatus::True,
                "ProcessRunning",
                "database process is running",
            ),
            (true, Err(e)) => PilotCondition::new(
                PilotCondition::STARTED,
                PilotConditionStatus::True,
                "SyncFailed",
                e.to_string(),
            ),
            (false, Ok(())) => PilotCondition::new(
                PilotCondition::STARTED,
                PilotConditionStatus::False,
                "ProcessNotRunning",
                "database process is not running",
            ),
            (false, Err(e)) => PilotCondition::new(
                PilotCondition::STARTED,
                PilotConditionStatus::False,
                "SyncFailed",
                e.to_string(),
            ),
        };
        pilot
            .status
            .get_or_insert_with(PilotStatus::default)
            .set_condition(condition);

        let updated = self.client.update_status(pilot).await?;
        self.state.lock().await.cached_self = Some(updated);
        Ok(())
    }

    /// Drain the work queue until shutdown, then run the stop sequence.
    ///
    /// Exactly one worker runs; process management must stay sequential.
    pub async fn run(&self, shutdown: CancellationToken) -> crate::Result<()> {
        info!(
            pilot = %self.pilot_name,
            namespace = %self.pilot_namespace,
            "Pilot reconciler started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !self.queue.shutting_down() => {
                    info!("Shutdown requested, draining work queue");
                    self.queue.shut_down();
                }
                maybe_key = self.queue.get() => {
                    let Some(key) = maybe_key else { break };
                    match self.sync(&key).await {
                        Ok(()) => self.queue.forget(&key),
                        Err(e) => {
                            // Sync failures are never fatal to the worker.
                            error!(key = %key, error = %e, "Sync failed, requeueing");
                            self.queue.add_rate_limited(&key);
                        }
                    }
                }
            }
        }
        self.shutdown().await
    }

    /// Graceful stop sequence: PreStop hooks, process stop, PostStop hooks.
    ///
    /// Suppresses future process starts first. All errors are collected and
    /// surfaced but none prevents the sequence from completing.
    pub async fn shutdown(&self) -> crate::Result<()> {
        info!("Running pilot shutdown sequence");
        let cached = {
            let mut state = self.state.lock().await;
            state.shutdown_requested = true;
            state.cached_self.clone()
        };

        let mut errors = Vec::new();

        if let Some(pilot) = &cached {
            if let Err(e) = self.transition_for_shutdown(PilotPhase::PreStop, pilot).await {
                errors.push(e);
            }
        }

        {
            let mut state = self.state.lock().await;
            if let Some(process) = state.process.as_mut() {
                if process.running() {
                    if let Err(e) = process.stop().await {
                        errors.push(e);
                    }
                }
            }
        }

        if let Some(pilot) = &cached {
            if let Err(e) = self.transition_for_shutdown(PilotPhase::PostStop, pilot).await {
                errors.push(e);
            }
        }

        Error::aggregate(errors)
    }

    async fn transition_for_shutdown(
        &self,
        phase: PilotPhase,
        pilot: &Pilot,
    ) -> crate::Result<()> {
        if let Err(e) = self.hooks.transition(phase, pilot) {
            self.events
                .publish(
                    &pilot.object_ref(&()),
                    EventType::Warning,
                    reasons::HOOK_FAILED,
                    actions::SHUTDOWN,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
        Ok(())
    }
}

/// Production [`PilotClient`] backed by a watch cache (reflector) for
/// reads and the API server for status writes.
pub struct KubePilotClient {
    api: Api<Pilot>,
    store: Store<Pilot>,
}

impl KubePilotClient {
    /// Start the watch for Pilots in `namespace`, feeding every touched
    /// object's key into the work queue. Returns the client and the watch
    /// task handle.
    pub fn start(
        client: Client,
        namespace: &str,
        queue: Arc<WorkQueue>,
    ) -> (Self, JoinHandle<()>) {
        let api: Api<Pilot> = Api::namespaced(client, namespace);
        let (store, writer) = reflector::store::<Pilot>();
        let stream = reflector(writer, watcher(api.clone(), WatcherConfig::default()));

        let handle = tokio::spawn(async move {
            let mut touched = std::pin::pin!(stream.touched_objects());
            while let Some(event) = touched.next().await {
                match event {
                    Ok(pilot) => {
                        if let Some(key) = object_key(&pilot) {
                            debug!(key, "Pilot event observed");
                            queue.add(&key);
                        }
                    }
                    Err(e) => warn!(error = %e, "Pilot watch error"),
                }
            }
        });

        (Self { api, store }, handle)
    }

    /// Wait until the watch cache has completed its initial list.
    ///
    /// A timeout here is a fatal startup error; reconciling against an
    /// unsynced cache would act on stale state.
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> crate::Result<()> {
        tokio::time::timeout(timeout, self.store.wait_until_ready())
            .await
            .map_err(|_| {
                Error::validation(format!(
                    "pilot cache did not sync within {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::validation(format!("pilot watch cache failed: {e}")))
    }
}

#[async_trait]
impl PilotClient for KubePilotClient {
    async fn get(&self, namespace: &str, name: &str) -> crate::Result<Option<Pilot>> {
        let key = ObjectRef::new(name).within(namespace);
        Ok(self.store.get(&key).map(|pilot| (*pilot).clone()))
    }

    async fn update_status(&self, pilot: &Pilot) -> crate::Result<Pilot> {
        let name = pilot.name_any();
        let mut attempt = 0;
        loop {
            attempt += 1;
            // Re-read for a fresh resourceVersion and apply our status on
            // top, so a conflicting write by another party is never
            // clobbered blind.
            let mut latest = self.api.get(&name).await?;
            latest.status = pilot.status.clone();
            let data = serde_json::to_vec(&latest)
                .map_err(|e| Error::serialization(format!("failed to encode pilot: {e}")))?;

            match self
                .api
                .replace_status(&name, &PostParams::default(), data)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(kube::Error::Api(e)) if e.code == 409 && attempt < STATUS_UPDATE_ATTEMPTS => {
                    warn!(pilot = %name, attempt, "Status update conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
