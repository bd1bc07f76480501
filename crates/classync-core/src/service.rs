//! Application-facing sync service
//!
//! [`SyncService`] wires the store, backend, session guard, hydrator and
//! scheduler together. The application root constructs it explicitly and
//! calls [`SyncService::init`] once a runtime is available and
//! [`SyncService::dispose`] before exiting.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::BackendApi;
use crate::config::Config;
use crate::connectivity::{spawn_health_probe, Connectivity, ConnectivityMonitor};
use crate::error::Result;
use crate::hydrate::{CacheHydrator, HydrationReport};
use crate::models::{
    CachedEntity, EntityType, MutationId, MutationLogEntry, MutationOp, Session, SyncCursor,
};
use crate::session::{ConflictCheck, Resolution, SessionGuard};
use crate::store::{lock_store, Recorded, SharedStore};
use crate::sync::{
    new_gate, CycleReport, EngineSettings, SchedulerEvent, SchedulerHandle, SchedulerState,
    SyncEngine, SyncGate, SyncScheduler,
};

/// Capacity of the scheduler event channel
const EVENT_BUFFER: usize = 32;

/// Snapshot of what the device holds and what the scheduler is doing
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub session: Option<Session>,
    pub pending: usize,
    pub failures: usize,
    pub entity_counts: Vec<(EntityType, usize)>,
    pub cursors: Vec<SyncCursor>,
    pub scheduler: SchedulerState,
    pub in_progress: bool,
    pub connectivity: Connectivity,
}

/// Owns the sync components for one device
pub struct SyncService {
    config: Config,
    store: SharedStore,
    backend: Arc<dyn BackendApi>,
    gate: SyncGate,
    engine: Arc<SyncEngine>,
    guard: SessionGuard,
    hydrator: CacheHydrator,
    connectivity: ConnectivityMonitor,
    cancel: CancellationToken,
    scheduler: Option<SchedulerHandle>,
    probe: Option<JoinHandle<()>>,
    events: Option<mpsc::Receiver<SchedulerEvent>>,
}

impl SyncService {
    pub fn new(config: Config, store: SharedStore, backend: Arc<dyn BackendApi>) -> Self {
        let gate = new_gate();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            backend.clone(),
            gate.clone(),
            EngineSettings::from_config(&config),
        ));
        let hydrator = CacheHydrator::new(store.clone(), backend.clone(), gate.clone(), &config);

        Self {
            guard: SessionGuard::new(store.clone()),
            config,
            store,
            backend,
            gate,
            engine,
            hydrator,
            connectivity: ConnectivityMonitor::default(),
            cancel: CancellationToken::new(),
            scheduler: None,
            probe: None,
            events: None,
        }
    }

    /// Use an externally driven connectivity feed instead of the default
    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== Lifecycle ====================

    /// Recover from an interrupted run and start the background scheduler
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a
    /// no-op.
    pub fn init(&mut self) -> Result<()> {
        if self.scheduler.is_some() {
            return Ok(());
        }

        let recovered = lock_store(&self.store)?.reset_in_flight()?;
        if recovered > 0 {
            info!(
                "Recovered {} mutations left in flight by the previous run",
                recovered
            );
        }

        if !self.config.sync_enabled {
            info!("Background sync disabled by configuration");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = SyncScheduler::new(
            self.engine.clone(),
            self.store.clone(),
            self.config.sync_interval(),
        )
        .with_connectivity(self.connectivity.subscribe())
        .with_events(tx)
        .spawn(self.cancel.child_token());

        self.scheduler = Some(handle);
        self.events = Some(rx);
        Ok(())
    }

    /// Poll the backend's health endpoint to drive connectivity
    pub fn start_health_probe(&mut self, interval: Duration) {
        if self.probe.is_some() {
            return;
        }
        self.probe = Some(spawn_health_probe(
            self.backend.clone(),
            self.connectivity.clone(),
            interval,
            self.config.request_timeout(),
            self.cancel.child_token(),
        ));
    }

    /// Stop the scheduler and probe
    ///
    /// A request in flight gets the configured grace period before it is
    /// abandoned.
    pub async fn dispose(&mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.scheduler.take() {
            let limit = self.config.shutdown_grace() + self.config.request_timeout();
            handle.shutdown(limit).await;
        }
        if let Some(probe) = self.probe.take() {
            if let Err(e) = probe.await {
                debug!("Health probe ended abnormally: {}", e);
            }
        }
        self.events = None;
        info!("Sync service disposed");
    }

    /// Take the scheduler event stream; only the first caller gets it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SchedulerEvent>> {
        self.events.take()
    }

    // ==================== Session ====================

    pub fn check_conflict(&self, candidate_user_id: &str) -> Result<ConflictCheck> {
        self.guard.check_conflict(candidate_user_id)
    }

    /// Resolve a login conflict; waits for a running cycle first
    pub async fn resolve(&self, candidate: &Session, should_clear: bool) -> Result<Resolution> {
        let _gate = self.gate.lock().await;
        self.guard.resolve(candidate, should_clear)
    }

    pub async fn activate(&self, session: &Session) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.guard.activate(session)
    }

    pub fn active_session(&self) -> Result<Option<Session>> {
        self.guard.active_session()
    }

    pub async fn hydrate_session(&self) -> Result<HydrationReport> {
        self.hydrator.hydrate_session().await
    }

    /// End the session; cached data stays for the next login to decide on
    pub async fn sign_out(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.guard.end_session()
    }

    // ==================== Local writes ====================

    /// Record a local write and nudge the scheduler when online
    pub fn record_mutation(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: MutationOp,
        payload: Value,
    ) -> Result<Recorded> {
        let recorded =
            lock_store(&self.store)?.record_mutation(entity_type, entity_id, operation, payload)?;
        if self.connectivity.current().is_online() {
            self.refresh();
        }
        Ok(recorded)
    }

    pub fn entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        Ok(lock_store(&self.store)?.entities(entity_type)?)
    }

    pub fn entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<CachedEntity>> {
        Ok(lock_store(&self.store)?.entity(entity_type, entity_id)?)
    }

    pub fn pending_mutations(&self) -> Result<Vec<MutationLogEntry>> {
        Ok(lock_store(&self.store)?.pending_mutations()?)
    }

    // ==================== Sync ====================

    /// Ask the background scheduler for a cycle; false if it isn't running
    pub fn refresh(&self) -> bool {
        self.scheduler.as_ref().is_some_and(|s| s.refresh())
    }

    /// Run one cycle in the foreground
    pub async fn sync_now(&self) -> Result<CycleReport> {
        self.engine
            .run_cycle(&self.cancel.child_token(), |phase| {
                debug!("Sync phase: {}", phase)
            })
            .await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler
            .as_ref()
            .map_or(SchedulerState::Idle, |s| s.state())
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    // ==================== Failures ====================

    pub fn failures(&self) -> Result<Vec<MutationLogEntry>> {
        Ok(lock_store(&self.store)?.failed_mutations()?)
    }

    pub fn failure_count(&self) -> Result<usize> {
        Ok(lock_store(&self.store)?.failure_count()?)
    }

    /// Put a failed mutation back in the queue
    pub fn retry_failed(&self, mutation_id: MutationId) -> Result<bool> {
        let retried = lock_store(&self.store)?.retry_failed(mutation_id)?;
        if retried {
            self.refresh();
        } else {
            warn!("No failed mutation {} to retry", mutation_id);
        }
        Ok(retried)
    }

    /// Drop a failed mutation and roll its entity back
    pub fn discard_failed(&self, mutation_id: MutationId) -> Result<bool> {
        Ok(lock_store(&self.store)?.discard_failed(mutation_id)?)
    }

    pub fn status(&self) -> Result<SyncStatus> {
        let store = lock_store(&self.store)?;
        Ok(SyncStatus {
            session: store.session()?,
            pending: store.pending_count()?,
            failures: store.failure_count()?,
            entity_counts: store.entity_counts()?,
            cursors: store.cursors()?,
            scheduler: self.scheduler_state(),
            in_progress: self.scheduler.as_ref().is_some_and(|s| s.in_progress()),
            connectivity: self.connectivity.current(),
        })
    }
}
