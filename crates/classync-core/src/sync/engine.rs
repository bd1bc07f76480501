//! One sync cycle: upload the mutation log, then pull changes
//!
//! The engine holds no state between cycles; everything it needs to
//! resume (attempt counts, backoff gates, cursors) lives in the store.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Backoff, SchedulerState, SyncGate};
use crate::api::{with_timeout, ApiError, BackendApi, ChangesRequest, MutationRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{EntityType, MutationLogEntry, MutationStatus, ServerRecord, SyncCursor};
use crate::session::require_owner;
use crate::store::{lock_store, SharedStore};

/// Tunables for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub backoff: Backoff,
    pub request_timeout: Duration,
    pub page_size: u32,
    /// How long an in-flight request may run on after cancellation
    pub shutdown_grace: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff: Backoff::from_config(config),
            request_timeout: config.request_timeout(),
            page_size: config.page_size.max(1),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Counters for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Mutations acknowledged by the server
    pub uploaded: usize,
    /// Retryable failures rescheduled with backoff
    pub retried: usize,
    /// Mutations moved to failed this cycle
    pub failed: usize,
    /// Entries not yet due because of backoff
    pub deferred: usize,
    /// In-flight requests given up after the shutdown grace period
    pub abandoned: usize,
    pub pulled: usize,
    pub deleted: usize,
    /// Pulled records ignored because the entity has local writes
    pub skipped: usize,
    pub pull_errors: usize,
    pub cancelled: bool,
}

enum Guarded<T> {
    Finished(std::result::Result<T, ApiError>),
    Abandoned,
}

/// Runs sync cycles against the backend
pub struct SyncEngine {
    store: SharedStore,
    backend: Arc<dyn BackendApi>,
    gate: SyncGate,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        backend: Arc<dyn BackendApi>,
        gate: SyncGate,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            backend,
            gate,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run one cycle: upload, then pull
    ///
    /// Waits for any hydration or other cycle to finish first. `on_phase`
    /// is told when the cycle moves between uploading and pulling.
    pub async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        on_phase: impl Fn(SchedulerState),
    ) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now(), cancel, on_phase).await
    }

    pub(crate) async fn run_cycle_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        on_phase: impl Fn(SchedulerState),
    ) -> Result<CycleReport> {
        let _gate = self.gate.lock().await;
        let owner = require_owner(&*lock_store(&self.store)?)?.user_id;

        let mut report = CycleReport::default();
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        on_phase(SchedulerState::Uploading);
        self.upload(&owner, now, cancel, &mut report).await?;

        if !report.cancelled {
            on_phase(SchedulerState::Pulling);
            self.pull(&owner, cancel, &mut report).await?;
        }

        info!(
            "Sync cycle done: {} uploaded, {} retrying, {} failed, {} pulled, {} kept local",
            report.uploaded, report.retried, report.failed, report.pulled, report.skipped
        );
        Ok(report)
    }

    /// Drain the log oldest-first, one entry per entity at a time
    ///
    /// An entity whose head entry can't go out (gated, failed, or just
    /// failed) is held for the rest of the cycle so its later entries
    /// never overtake it at the server.
    async fn upload(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let queue = lock_store(&self.store)?.mutation_log()?;
        let mut held: HashSet<(EntityType, String)> = HashSet::new();

        for entry in queue {
            let key = (entry.entity_type, entry.entity_id.clone());
            if held.contains(&key) {
                continue;
            }
            if entry.owner_user_id != owner || entry.status != MutationStatus::Pending {
                held.insert(key);
                continue;
            }
            if !entry.is_due(now) {
                report.deferred += 1;
                held.insert(key);
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            // The foreground may have cancelled the entry since the log was read
            if !lock_store(&self.store)?.mark_in_flight(entry.mutation_id)? {
                debug!("Mutation {} left the queue; skipping", entry.mutation_id);
                continue;
            }
            let request = MutationRequest::from(&entry);

            match self.guarded(cancel, self.backend.push_mutation(&request)).await {
                Guarded::Finished(Ok(ack)) => {
                    lock_store(&self.store)?.acknowledge(entry.mutation_id, &ack)?;
                    debug!("Mutation {} acknowledged", entry.mutation_id);
                    report.uploaded += 1;
                }
                Guarded::Finished(Err(error)) => {
                    let error = Error::from_upload(error, entry.mutation_id);
                    self.record_failure(&entry, &error, now, report)?;
                    held.insert(key);
                }
                Guarded::Abandoned => {
                    warn!(
                        "Abandoned in-flight mutation {} after shutdown grace period",
                        entry.mutation_id
                    );
                    lock_store(&self.store)?.release_in_flight(entry.mutation_id)?;
                    report.abandoned += 1;
                    report.cancelled = true;
                    break;
                }
            }
        }
        Ok(())
    }

    fn record_failure(
        &self,
        entry: &MutationLogEntry,
        error: &Error,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let attempts = entry.attempts + 1;
        let reason = error.to_string();
        let mut store = lock_store(&self.store)?;

        if !error.is_retryable() {
            warn!(
                "{} ({} {}/{})",
                reason, entry.operation, entry.entity_type, entry.entity_id
            );
            store.mark_failed(entry.mutation_id, attempts, &reason)?;
            report.failed += 1;
        } else if self.settings.backoff.exhausted(attempts) {
            warn!(
                "Mutation {} gave up after {} attempts: {}",
                entry.mutation_id, attempts, reason
            );
            store.mark_failed(entry.mutation_id, attempts, &reason)?;
            report.failed += 1;
        } else {
            let delay = self.settings.backoff.delay(attempts);
            let next = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            warn!(
                "Mutation {} failed (attempt {}), retrying in {:?}: {}",
                entry.mutation_id, attempts, delay, reason
            );
            store.schedule_retry(entry.mutation_id, attempts, &reason, next)?;
            report.retried += 1;
        }
        Ok(())
    }

    /// Pull changes for every entity type that has a cursor
    async fn pull(
        &self,
        owner: &str,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let cursors = lock_store(&self.store)?.cursors()?;

        for cursor in cursors {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.drain_changes(&cursor, cancel).await {
                Guarded::Finished(Ok((records, next))) => {
                    let applied = lock_store(&self.store)?.apply_pulled(
                        cursor.entity_type,
                        &records,
                        owner,
                        &next,
                    )?;
                    debug!(
                        "Pulled {}: {} applied, {} deleted, {} kept local, {} stale{}",
                        cursor.entity_type,
                        applied.applied,
                        applied.deleted,
                        applied.skipped,
                        applied.stale,
                        if applied.cursor_held { " (cursor held)" } else { "" }
                    );
                    report.pulled += applied.applied;
                    report.deleted += applied.deleted;
                    report.skipped += applied.skipped;
                }
                Guarded::Finished(Err(error)) => {
                    warn!("Pull of {} failed: {}", cursor.entity_type, error);
                    report.pull_errors += 1;
                }
                Guarded::Abandoned => {
                    report.cancelled = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Fetch every change page since the cursor
    ///
    /// Returns the records plus the cursor to store once they are applied.
    async fn drain_changes(
        &self,
        cursor: &SyncCursor,
        cancel: &CancellationToken,
    ) -> Guarded<(Vec<ServerRecord>, SyncCursor)> {
        let started_at = Utc::now();
        let mut records = Vec::new();
        let mut next = SyncCursor {
            entity_type: cursor.entity_type,
            last_synced_at: Some(started_at),
            last_sync_token: cursor.last_sync_token.clone(),
        };
        let mut page = 1;

        loop {
            let request = ChangesRequest {
                entity_type: cursor.entity_type,
                since: if cursor.last_sync_token.is_some() {
                    None
                } else {
                    cursor.last_synced_at
                },
                token: cursor.last_sync_token.clone(),
                page,
                limit: self.settings.page_size,
            };

            let result = match self
                .guarded(cancel, self.backend.fetch_changes_page(&request))
                .await
            {
                Guarded::Finished(result) => result,
                Guarded::Abandoned => return Guarded::Abandoned,
            };
            let fetched = match result {
                Ok(fetched) => fetched,
                Err(error) => return Guarded::Finished(Err(error)),
            };

            let last = fetched.is_last(self.settings.page_size) || fetched.items.is_empty();
            if let Some(token) = fetched.sync_token {
                next.last_sync_token = Some(token);
            }
            if let Some(server_time) = fetched.server_time {
                next.last_synced_at = Some(server_time);
            }
            records.extend(fetched.items);

            if last {
                break;
            }
            page += 1;
        }

        Guarded::Finished(Ok((records, next)))
    }

    /// Run a backend call under the request timeout, honoring cancellation
    ///
    /// Once cancelled, the call may still finish within the grace period;
    /// after that it is abandoned.
    async fn guarded<T, F>(&self, cancel: &CancellationToken, call: F) -> Guarded<T>
    where
        F: Future<Output = std::result::Result<T, ApiError>>,
    {
        let call = with_timeout(self.settings.request_timeout, call);
        tokio::pin!(call);

        tokio::select! {
            biased;
            result = &mut call => Guarded::Finished(result),
            _ = cancel.cancelled() => {
                debug!("Cancelled; waiting up to {:?} for the request in flight", self.settings.shutdown_grace);
                match tokio::time::timeout(self.settings.shutdown_grace, &mut call).await {
                    Ok(result) => Guarded::Finished(result),
                    Err(_) => Guarded::Abandoned,
                }
            }
        }
    }
}
