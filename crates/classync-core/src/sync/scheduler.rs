//! Sync scheduler
//!
//! A background task that decides when sync cycles run. States move
//! `Idle → Triggered → Uploading → Pulling → Idle` and are published on a
//! watch channel.
//!
//! Triggers that arrive while a cycle runs are coalesced into a single
//! rerun once it finishes. Timer ticks are skipped while offline; manual
//! refreshes and reconnects always run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CycleReport, SyncEngine};
use crate::connectivity::Connectivity;
use crate::error::Error;
use crate::store::{lock_store, SharedStore};

/// Where the scheduler currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Triggered,
    Uploading,
    Pulling,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Triggered => "triggered",
            SchedulerState::Uploading => "uploading",
            SchedulerState::Pulling => "pulling",
        })
    }
}

/// Why a cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Tick,
    Reconnect,
    Manual,
}

/// Events from the scheduler task
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A cycle finished; counts are read after it
    CycleFinished {
        trigger: Trigger,
        report: CycleReport,
        pending: usize,
        failures: usize,
    },
    /// A cycle could not run or stopped early
    Error(String),
    /// The scheduler task exited
    Stopped,
}

/// Handle for controlling the scheduler task
pub struct SchedulerHandle {
    triggers: mpsc::Sender<Trigger>,
    state: watch::Receiver<SchedulerState>,
    in_progress: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask for a cycle; returns false once the scheduler has stopped
    pub fn trigger(&self, trigger: Trigger) -> bool {
        match self.triggers.try_send(trigger) {
            Ok(()) => true,
            // A queued trigger already guarantees a rerun
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn refresh(&self) -> bool {
        self.trigger(Trigger::Manual)
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Whether a cycle is running right now
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Stop future cycles and wait for the task to wind down
    ///
    /// A request in flight gets the engine's grace period; the wait here
    /// is bounded by `limit` after which the task is aborted.
    pub async fn shutdown(self, limit: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(limit, &mut task).await.is_err() {
            warn!("Scheduler did not stop within {:?}; aborting", limit);
            task.abort();
        }
    }
}

/// Builder for the scheduler task
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    store: SharedStore,
    interval: Duration,
    connectivity: Option<watch::Receiver<Connectivity>>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, store: SharedStore, interval: Duration) -> Self {
        Self {
            engine,
            store,
            interval,
            connectivity: None,
            events: None,
        }
    }

    /// Follow a connectivity feed: offline skips ticks, reconnect triggers a cycle
    pub fn with_connectivity(mut self, connectivity: watch::Receiver<Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Spawn the scheduler task
    pub fn spawn(self, cancel: CancellationToken) -> SchedulerHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);
        let in_progress = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(self.run(trigger_rx, state_tx, in_progress.clone(), cancel.clone()));

        SchedulerHandle {
            triggers: trigger_tx,
            state: state_rx,
            in_progress,
            cancel,
            task,
        }
    }

    async fn run(
        mut self,
        mut triggers: mpsc::Receiver<Trigger>,
        state: watch::Sender<SchedulerState>,
        in_progress: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut online = self.is_online();

        info!("Sync scheduler started (interval {:?})", self.interval);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(trigger) = triggers.recv() => trigger,
                changed = next_connectivity(&mut self.connectivity) => {
                    let Some(status) = changed else {
                        self.connectivity = None;
                        continue;
                    };
                    let was_online = online;
                    online = status.is_online();
                    if online && !was_online {
                        info!("Connectivity restored");
                        Trigger::Reconnect
                    } else {
                        if !online && was_online {
                            info!("Connectivity lost; pausing timed sync");
                        }
                        continue;
                    }
                }
                _ = ticker.tick() => Trigger::Tick,
            };

            if trigger == Trigger::Tick && !online {
                debug!("Offline; skipping scheduled sync");
                continue;
            }

            self.run_coalesced(trigger, &mut triggers, &mut ticker, &state, &in_progress, &cancel)
                .await;
        }

        state.send_replace(SchedulerState::Idle);
        self.emit(SchedulerEvent::Stopped);
        info!("Sync scheduler stopped");
    }

    /// Run a cycle, then one more for each burst of triggers that arrived meanwhile
    async fn run_coalesced(
        &self,
        first: Trigger,
        triggers: &mut mpsc::Receiver<Trigger>,
        ticker: &mut Interval,
        state: &watch::Sender<SchedulerState>,
        in_progress: &AtomicBool,
        cancel: &CancellationToken,
    ) {
        let mut trigger = first;
        loop {
            state.send_replace(SchedulerState::Triggered);
            in_progress.store(true, Ordering::SeqCst);
            debug!("Sync cycle triggered by {:?}", trigger);

            let outcome = self
                .engine
                .run_cycle(cancel, |phase| {
                    state.send_replace(phase);
                })
                .await;

            in_progress.store(false, Ordering::SeqCst);
            state.send_replace(SchedulerState::Idle);
            self.report(trigger, outcome);

            // The next tick counts from the end of this cycle
            ticker.reset();

            if cancel.is_cancelled() {
                break;
            }

            let mut rerun: Option<Trigger> = None;
            while let Ok(next) = triggers.try_recv() {
                rerun = Some(match (rerun, next) {
                    (Some(Trigger::Manual), _) | (_, Trigger::Manual) => Trigger::Manual,
                    (Some(Trigger::Reconnect), _) | (_, Trigger::Reconnect) => Trigger::Reconnect,
                    _ => Trigger::Tick,
                });
            }

            match rerun {
                Some(Trigger::Tick) if !self.is_online() => {
                    debug!("Went offline during the cycle; dropping coalesced tick");
                    break;
                }
                Some(next) => {
                    debug!("Coalesced triggers; running again");
                    trigger = next;
                }
                None => break,
            }
        }
    }

    /// Latest connectivity, including changes the run loop hasn't seen yet
    fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map_or(true, |c| c.borrow().is_online())
    }

    fn report(&self, trigger: Trigger, outcome: crate::error::Result<CycleReport>) {
        match outcome {
            Ok(report) => {
                let counts = lock_store(&self.store)
                    .and_then(|store| Ok((store.pending_count()?, store.failure_count()?)));
                match counts {
                    Ok((pending, failures)) => self.emit(SchedulerEvent::CycleFinished {
                        trigger,
                        report,
                        pending,
                        failures,
                    }),
                    Err(e) => {
                        error!("Failed to read queue counts: {}", e);
                        self.emit(SchedulerEvent::Error(e.to_string()));
                    }
                }
            }
            Err(e @ Error::Storage(_)) => {
                error!("Sync cycle aborted by storage failure: {}", e);
                self.emit(SchedulerEvent::Error(e.to_string()));
            }
            Err(e) => {
                warn!("Sync cycle skipped: {}", e);
                self.emit(SchedulerEvent::Error(e.to_string()));
            }
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                debug!("Scheduler event dropped; receiver is full or gone");
            }
        }
    }
}

/// Next connectivity value, or None once the feed is gone
///
/// Never resolves without a feed.
async fn next_connectivity(feed: &mut Option<watch::Receiver<Connectivity>>) -> Option<Connectivity> {
    match feed {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use crate::models::{EntityType, MutationOp};
    use crate::sync::{new_gate, Backoff, EngineSettings};
    use crate::test_support::{teacher_store, timeout, FakeBackend, PushStep};
    use serde_json::json;

    struct Harness {
        store: SharedStore,
        backend: Arc<FakeBackend>,
        handle: SchedulerHandle,
        events: mpsc::Receiver<SchedulerEvent>,
        monitor: ConnectivityMonitor,
    }

    fn harness(interval: Duration, initial: Connectivity) -> Harness {
        let store = teacher_store("teacher-7");
        let backend = FakeBackend::new();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            backend.clone(),
            new_gate(),
            EngineSettings {
                backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 5),
                request_timeout: Duration::from_secs(15),
                page_size: 50,
                shutdown_grace: Duration::from_secs(5),
            },
        ));
        let monitor = ConnectivityMonitor::new(initial);
        let (events_tx, events) = mpsc::channel(64);
        let handle = SyncScheduler::new(engine, store.clone(), interval)
            .with_connectivity(monitor.subscribe())
            .with_events(events_tx)
            .spawn(CancellationToken::new());

        Harness {
            store,
            backend,
            handle,
            events,
            monitor,
        }
    }

    fn record(store: &SharedStore, id: &str) {
        lock_store(store)
            .unwrap()
            .record_mutation(EntityType::Marks, id, MutationOp::Create, json!({"score": 1}))
            .unwrap();
    }

    async fn next_cycle(events: &mut mpsc::Receiver<SchedulerEvent>) -> (Trigger, CycleReport) {
        loop {
            match events.recv().await {
                Some(SchedulerEvent::CycleFinished { trigger, report, .. }) => return (trigger, report),
                Some(_) => continue,
                None => panic!("scheduler stopped"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drains_queue() {
        let mut h = harness(Duration::from_secs(60), Connectivity::Online);
        record(&h.store, "M1");

        let (trigger, report) = next_cycle(&mut h.events).await;
        assert_eq!(trigger, Trigger::Tick);
        assert_eq!(report.uploaded, 1);
        assert_eq!(h.handle.state(), SchedulerState::Idle);
        assert!(!h.handle.in_progress());

        h.handle.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_skips_ticks_and_reconnect_triggers() {
        let mut h = harness(Duration::from_secs(30), Connectivity::Offline);
        record(&h.store, "M1");

        // Several intervals pass offline without any upload
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(h.backend.pushes().is_empty());
        assert!(h.events.try_recv().is_err());

        h.monitor.report(Connectivity::Online);
        let (trigger, report) = next_cycle(&mut h.events).await;
        assert_eq!(trigger, Trigger::Reconnect);
        assert_eq!(report.uploaded, 1);

        h.handle.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_runs_while_offline() {
        let mut h = harness(Duration::from_secs(3600), Connectivity::Offline);
        record(&h.store, "M1");

        assert!(h.handle.refresh());
        let (trigger, report) = next_cycle(&mut h.events).await;
        assert_eq!(trigger, Trigger::Manual);
        assert_eq!(report.uploaded, 1);

        h.handle.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_cycle_are_coalesced() {
        let mut h = harness(Duration::from_secs(3600), Connectivity::Online);
        // Let the startup tick finish with an empty queue
        next_cycle(&mut h.events).await;

        record(&h.store, "M1");
        h.backend.script_push([PushStep::Delay(Duration::from_secs(3))]);
        assert!(h.handle.refresh());

        // Wait until the slow upload is in flight, then pile on triggers
        let mut states = h.handle.subscribe();
        while *states.borrow_and_update() != SchedulerState::Uploading {
            states.changed().await.unwrap();
        }
        assert!(h.handle.in_progress());
        for _ in 0..5 {
            assert!(h.handle.refresh());
        }

        let (_, first) = next_cycle(&mut h.events).await;
        assert_eq!(first.uploaded, 1);
        let (trigger, second) = next_cycle(&mut h.events).await;
        assert_eq!(trigger, Trigger::Manual);
        assert_eq!(second.uploaded, 0);

        // No third cycle is queued
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.events.try_recv().is_err());

        h.handle.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_tick_dropped_after_going_offline() {
        let mut h = harness(Duration::from_secs(3600), Connectivity::Online);
        next_cycle(&mut h.events).await;

        record(&h.store, "M1");
        h.backend.script_push([PushStep::Delay(Duration::from_secs(3))]);
        assert!(h.handle.refresh());

        let mut states = h.handle.subscribe();
        while *states.borrow_and_update() != SchedulerState::Uploading {
            states.changed().await.unwrap();
        }
        assert!(h.handle.trigger(Trigger::Tick));
        h.monitor.report(Connectivity::Offline);

        let (trigger, report) = next_cycle(&mut h.events).await;
        assert_eq!(trigger, Trigger::Manual);
        assert_eq!(report.uploaded, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.backend.pushes().len(), 1);

        h.handle.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reported_and_loop_survives() {
        let mut h = harness(Duration::from_secs(10), Connectivity::Online);
        record(&h.store, "M1");
        h.backend.script_push([PushStep::Fail(timeout())]);

        let (_, report) = next_cycle(&mut h.events).await;
        assert_eq!(report.retried, 1);
        assert_eq!(h.handle.state(), SchedulerState::Idle);

        // Open the backoff gate, then the next cycle uploads it
        {
            let mut store = lock_store(&h.store).unwrap();
            let entry = store.pending_mutations().unwrap().remove(0);
            store
                .schedule_retry(entry.mutation_id, entry.attempts, "timed out", chrono::Utc::now())
                .unwrap();
        }
        assert!(h.handle.refresh());
        let mut uploaded = 0;
        while uploaded == 0 {
            let (_, report) = next_cycle(&mut h.events).await;
            uploaded = report.uploaded;
        }
        assert_eq!(h.backend.applied().len(), 1);

        h.handle.shutdown(Duration::from_secs(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_future_cycles() {
        let mut h = harness(Duration::from_secs(5), Connectivity::Online);
        next_cycle(&mut h.events).await;

        let trigger_tx = h.handle.triggers.clone();
        h.handle.shutdown(Duration::from_secs(10)).await;

        loop {
            match h.events.recv().await {
                Some(SchedulerEvent::Stopped) | None => break,
                Some(_) => continue,
            }
        }
        assert!(trigger_tx.is_closed());
    }
}
