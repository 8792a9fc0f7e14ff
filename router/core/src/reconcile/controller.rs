//! Reconcile Controller
//!
//! Drives registrations from a [`DescriptorStore`] into the registry.
//!
//! # Guarantees
//!
//! - At most one reconciliation per backend identity is in flight; duplicate
//!   events while one runs collapse into a single follow-up run.
//! - Discovery never runs under the registry lock.
//! - Failures are retried with per-identity exponential backoff until the
//!   backend is reconciled or deleted.
//! - Malformed registrations are skipped until their source changes.
//! - Deletions bypass discovery and take effect immediately.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::backoff::Backoff;
use super::queue::WorkQueue;
use super::stats::{ControllerStats, StatsSnapshot};
use super::{DescriptorStore, RegistrationEvent};
use crate::config::ReconcileConfig;
use crate::descriptor::{BackendId, BackendSource};
use crate::discovery::{discover, DiscoveryGateway};
use crate::error::RouterError;
use crate::routing::BackendRegistry;

/// Where a backend identity is in its reconcile lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileState {
    /// Queued, waiting for a worker
    Pending,
    /// A worker is reconciling it
    Reconciling,
    /// Registered with its latest catalog
    Settled,
    /// Last attempt failed; a retry is scheduled
    Failed {
        /// Consecutive failed attempts
        attempts: u32,
        /// Last failure
        error: String,
    },
    /// Registration is invalid; skipped until it changes
    Malformed {
        /// What is wrong with it
        reason: String,
    },
}

/// Tuning for [`ReconcileController`]
#[derive(Clone, Copy, Debug)]
pub struct ControllerOptions {
    /// Concurrent reconcile workers
    pub workers: usize,
    /// Interval between full resyncs of every registration
    pub resync_interval: Duration,
    /// Retry policy for failed reconciliations
    pub backoff: Backoff,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            resync_interval: Duration::from_secs(60),
            backoff: Backoff::default(),
        }
    }
}

impl ControllerOptions {
    /// Build from the `[reconcile]` configuration section
    #[must_use]
    pub fn from_config(config: &ReconcileConfig) -> Self {
        Self {
            workers: config.workers,
            resync_interval: Duration::from_secs(config.resync_interval_secs),
            backoff: Backoff::from_config(config),
        }
    }
}

enum Outcome {
    Registered,
    Removed,
    SkippedMalformed(String),
}

/// Consumes registration events and keeps the registry reconciled
pub struct ReconcileController {
    registry: BackendRegistry,
    store: Arc<dyn DescriptorStore>,
    gateway: Arc<dyn DiscoveryGateway>,
    queue: WorkQueue<BackendId>,
    states: DashMap<BackendId, ReconcileState>,
    malformed: DashMap<BackendId, (BackendSource, String)>,
    stats: ControllerStats,
    options: ControllerOptions,
}

impl ReconcileController {
    /// Create a controller; nothing runs until [`Self::run`]
    #[must_use]
    pub fn new(
        registry: BackendRegistry,
        store: Arc<dyn DescriptorStore>,
        gateway: Arc<dyn DiscoveryGateway>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            registry,
            store,
            gateway,
            queue: WorkQueue::new(options.backoff),
            states: DashMap::new(),
            malformed: DashMap::new(),
            stats: ControllerStats::new(),
            options,
        }
    }

    /// Registry this controller writes to
    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Lifecycle state of `id`, if the controller has seen it
    #[must_use]
    pub fn state_of(&self, id: &BackendId) -> Option<ReconcileState> {
        self.states.get(id).map(|state| state.clone())
    }

    /// Identities waiting for a worker
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// React to a registration change
    ///
    /// Adds and updates are queued (coalescing duplicates). Deletions remove
    /// the backend from the registry right away and cancel pending work.
    pub fn handle_event(&self, event: RegistrationEvent) {
        match event {
            RegistrationEvent::Added(source) | RegistrationEvent::Updated(source) => {
                self.enqueue(source.id());
            }
            RegistrationEvent::Deleted(id) => {
                if self.registry.remove(&id) {
                    self.stats.record_removal();
                }
                self.queue.discard(&id);
                self.states.remove(&id);
                self.malformed.remove(&id);
                tracing::debug!(backend = %id, "Registration deleted");
            }
        }
    }

    /// Queue every identity the store lists or the registry still holds
    ///
    /// Registered backends the store no longer lists are queued too, so a
    /// missed delete event is repaired on the next pass.
    ///
    /// # Errors
    ///
    /// Returns the store's error if listing fails.
    pub async fn sync_all(&self) -> Result<usize, RouterError> {
        let mut ids: BTreeSet<BackendId> = self.store.list().await?.into_iter().collect();
        for id in self.registry.backend_ids() {
            if ids.insert(id.clone()) {
                tracing::debug!(backend = %id, "Registered backend missing from store");
            }
        }
        let count = ids.len();
        for id in ids {
            self.enqueue(id);
        }
        Ok(count)
    }

    fn enqueue(&self, id: BackendId) {
        if self.queue.is_shutting_down() {
            return;
        }
        self.states
            .entry(id.clone())
            .and_modify(|state| {
                if *state != ReconcileState::Reconciling {
                    *state = ReconcileState::Pending;
                }
            })
            .or_insert(ReconcileState::Pending);
        self.queue.add(id);
    }

    /// Run workers, consume `events` and resync until `shutdown` flips
    ///
    /// On shutdown the queue stops handing out work, in-flight
    /// reconciliations finish, and the method returns once every worker
    /// has exited.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RegistrationEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let workers = self.options.workers.max(1);
        tracing::info!(
            workers,
            resync_secs = self.options.resync_interval.as_secs(),
            "Starting reconcile controller"
        );

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let controller = Arc::clone(&self);
            tasks.spawn(async move { controller.worker(worker).await });
        }

        match self.sync_all().await {
            Ok(count) => tracing::info!(backends = count, "Initial sync queued"),
            Err(e) => tracing::warn!(error = %e, "Initial sync failed; waiting for resync"),
        }

        let period = self.options.resync_interval.max(Duration::from_millis(1));
        let mut resync = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut events_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Shutdown sender dropped");
                        break;
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            tracing::warn!("Registration event stream closed; relying on resync");
                            events_open = false;
                        }
                    }
                }
                _ = resync.tick() => {
                    self.stats.record_resync();
                    match self.sync_all().await {
                        Ok(count) => tracing::debug!(backends = count, "Resync queued"),
                        Err(e) => tracing::warn!(error = %e, "Resync failed"),
                    }
                }
            }
        }

        tracing::info!("Stopping reconcile controller");
        self.queue.shutdown();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Reconcile worker panicked");
            }
        }
        tracing::info!("Reconcile controller stopped");
    }

    async fn worker(&self, worker: usize) {
        tracing::debug!(worker, "Reconcile worker started");
        while let Some(id) = self.queue.get().await {
            self.process(&id).await;
            self.queue.done(&id);
        }
        tracing::debug!(worker, "Reconcile worker shutting down");
    }

    /// Reconcile one identity and record the outcome
    async fn process(&self, id: &BackendId) {
        self.states.insert(id.clone(), ReconcileState::Reconciling);

        let span = tracing::info_span!("reconcile", backend = %id);
        let result = self.reconcile(id).instrument(span).await;

        match result {
            Ok(Outcome::Registered) => {
                self.queue.forget(id);
                self.states.insert(id.clone(), ReconcileState::Settled);
                self.stats.record_reconcile();
            }
            Ok(Outcome::Removed) => {
                self.queue.forget(id);
                self.states.remove(id);
            }
            Ok(Outcome::SkippedMalformed(reason)) => {
                self.queue.forget(id);
                self.states
                    .insert(id.clone(), ReconcileState::Malformed { reason });
            }
            Err(RouterError::MalformedDescriptor { reason, .. }) => {
                tracing::warn!(backend = %id, reason = %reason, "Skipping malformed registration");
                self.queue.forget(id);
                self.states
                    .insert(id.clone(), ReconcileState::Malformed { reason });
                self.stats.record_malformed();
            }
            Err(e) => {
                let attempts = self.queue.num_requeues(id).saturating_add(1);
                let delay = self.queue.add_rate_limited(id.clone());
                tracing::error!(
                    backend = %id,
                    error = %e,
                    attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconciliation failed"
                );
                self.states.insert(
                    id.clone(),
                    ReconcileState::Failed {
                        attempts,
                        error: e.to_string(),
                    },
                );
                self.stats.record_failure();
            }
        }
    }

    async fn reconcile(&self, id: &BackendId) -> Result<Outcome, RouterError> {
        let Some(source) = self.store.get(id).await? else {
            if self.registry.remove(id) {
                self.stats.record_removal();
            }
            self.malformed.remove(id);
            tracing::info!("Registration no longer exists");
            return Ok(Outcome::Removed);
        };

        let known_bad = self
            .malformed
            .get(id)
            .and_then(|bad| (bad.0 == source).then(|| bad.1.clone()));
        if let Some(reason) = known_bad {
            tracing::debug!("Registration unchanged since it was found malformed");
            return Ok(Outcome::SkippedMalformed(reason));
        }

        let descriptor = match source.to_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                if let RouterError::MalformedDescriptor { reason, .. } = &e {
                    self.malformed.insert(id.clone(), (source, reason.clone()));
                }
                return Err(e);
            }
        };
        self.malformed.remove(id);

        let discovered = discover(self.gateway.as_ref(), &descriptor)
            .await
            .map_err(|source| RouterError::BackendUnreachable {
                backend: id.clone(),
                source,
            })?;

        self.registry.upsert(
            descriptor,
            discovered.custom,
            discovered.external,
            discovered.client,
        );
        Ok(Outcome::Registered)
    }
}
