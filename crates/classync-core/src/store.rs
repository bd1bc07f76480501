//! Local mutation store
//!
//! `LocalStore` owns the SQLite database and is the only code that touches
//! its rows. It keeps two views of every cached entity:
//!
//! - `server_payload`: the last payload the server acknowledged
//! - `payload`: what reads show, i.e. `server_payload` with every queued
//!   log entry replayed on top
//!
//! Every write that changes the log re-derives the visible payload and the
//! [`SyncState`] from those two inputs in the same transaction, so the cache
//! and the log cannot drift apart.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = LocalStore::open(&config)?;
//! store.record_mutation(EntityType::Attendance, "S1-C1-2024-05-01",
//!     MutationOp::Create, json!({"status": "present"}))?;
//! let row = store.entity(EntityType::Attendance, "S1-C1-2024-05-01")?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::Acknowledgement;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    CachedEntity, EntityType, MutationId, MutationLogEntry, MutationOp, MutationStatus,
    ServerRecord, Session, SyncCursor, SyncState,
};
use crate::storage::{init_schema, needs_init, StorageError, StorageResult};

/// Store shared between the foreground and the scheduler task
///
/// The lock is only ever held for synchronous row work, never across an
/// await point.
pub type SharedStore = Arc<Mutex<LocalStore>>;

/// Wrap a store for sharing
pub fn shared(store: LocalStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store, mapping poisoning to a storage error
pub fn lock_store(store: &SharedStore) -> StorageResult<MutexGuard<'_, LocalStore>> {
    store.lock().map_err(|_| StorageError::LockPoisoned)
}

/// Outcome of recording a local write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Appended to the log under this idempotency key
    Queued(MutationId),
    /// A delete of a never-uploaded create; the queued entries were dropped
    Cancelled { dropped: usize },
}

/// What a pull applied for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullApplied {
    pub applied: usize,
    pub deleted: usize,
    /// Entities left alone because they have local log entries
    pub skipped: usize,
    /// Records older than the cached version
    pub stale: usize,
    /// The cursor stayed put so skipped records are pulled again
    pub cursor_held: bool,
}

/// SQLite-backed local store
pub struct LocalStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open the store at the configured data directory
    pub fn open(config: &Config) -> StorageResult<Self> {
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)
                .map_err(|e| StorageError::from_io(e, config.data_dir.clone()))?;
        }
        Self::open_path(&config.sqlite_path())
    }

    /// Open (or create) a database file
    pub fn open_path(path: &Path) -> StorageResult<Self> {
        let conn =
            Connection::open(path).map_err(|e| StorageError::from_sqlite(e, path.to_path_buf()))?;
        Self::prepare(conn, Some(path.to_path_buf()))
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::prepare(Connection::open_in_memory()?, None)
    }

    fn prepare(conn: Connection, path: Option<PathBuf>) -> StorageResult<Self> {
        let classify = |e: rusqlite::Error| match &path {
            Some(p) => StorageError::from_sqlite(e, p.clone()),
            None => StorageError::Database(e),
        };

        if path.is_some() {
            // journal_mode returns a row, so query it instead of executing
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
                .map_err(classify)?;
        }
        if needs_init(&conn) {
            init_schema(&conn).map_err(classify)?;
        }

        Ok(Self { conn, path })
    }

    /// Database file path (None for in-memory stores)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ==================== Session ====================

    /// The session that currently owns the store
    pub fn session(&self) -> StorageResult<Option<Session>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, role, school_id, authenticated_at FROM session WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(user_id, role, school_id, at)| {
            Ok::<_, StorageError>(Session {
                user_id,
                role: role.parse()?,
                school_id,
                authenticated_at: from_millis(at)?,
            })
        })
        .transpose()
    }

    /// Install a session, optionally wiping everything cached first
    ///
    /// Both steps happen in one transaction.
    pub fn begin_session(&mut self, session: &Session, clear: bool) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        if clear {
            wipe(&tx)?;
        }
        write_session(&tx, session)?;
        tx.commit()?;

        info!(
            "Session started for {} ({}), cache {}",
            session.user_id,
            session.role,
            if clear { "cleared" } else { "retained" }
        );
        Ok(())
    }

    /// Forget the active session; cached rows stay on the device
    pub fn end_session(&mut self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM session", [])?;
        Ok(())
    }

    /// Distinct owners of cached rows or log entries other than `user_id`
    pub fn foreign_owners(&self, user_id: &str) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT owner_user_id FROM cached_entities WHERE owner_user_id != ?1
             UNION
             SELECT owner_user_id FROM mutation_log WHERE owner_user_id != ?1
             ORDER BY 1",
        )?;
        let owners = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(owners)
    }

    /// Delete every cached row, log entry, staged row and cursor
    pub fn clear_all(&mut self) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        wipe(&tx)?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Reads ====================

    /// A cached entity, including ones pending deletion
    pub fn entity(&self, entity_type: EntityType, entity_id: &str) -> StorageResult<Option<CachedEntity>> {
        load_entity(&self.conn, entity_type, entity_id)
    }

    /// Visible entities of a type (pending deletes are hidden)
    pub fn entities(&self, entity_type: EntityType) -> StorageResult<Vec<CachedEntity>> {
        let sql = format!(
            "SELECT {} FROM cached_entities
             WHERE entity_type = ? AND sync_state != 'pending_delete'
             ORDER BY entity_id",
            ENTITY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([entity_type.as_str()], EntityRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    /// Number of visible entities per type, in [`EntityType::ALL`] order
    pub fn entity_counts(&self) -> StorageResult<Vec<(EntityType, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*) FROM cached_entities
             WHERE entity_type = ? AND sync_state != 'pending_delete'",
        )?;
        EntityType::ALL
            .iter()
            .map(|t| {
                let count: i64 = stmt.query_row([t.as_str()], |row| row.get(0))?;
                Ok::<_, StorageError>((*t, count as usize))
            })
            .collect()
    }

    /// Every log entry in upload order
    pub fn mutation_log(&self) -> StorageResult<Vec<MutationLogEntry>> {
        query_entries(
            &self.conn,
            &format!(
                "SELECT {} FROM mutation_log ORDER BY created_at, seq",
                LOG_COLUMNS
            ),
            [],
        )
    }

    /// Entries still waiting for the server (pending or in flight)
    pub fn pending_mutations(&self) -> StorageResult<Vec<MutationLogEntry>> {
        query_entries(
            &self.conn,
            &format!(
                "SELECT {} FROM mutation_log WHERE status != 'failed' ORDER BY created_at, seq",
                LOG_COLUMNS
            ),
            [],
        )
    }

    /// Entries that need manual action
    pub fn failed_mutations(&self) -> StorageResult<Vec<MutationLogEntry>> {
        query_entries(
            &self.conn,
            &format!(
                "SELECT {} FROM mutation_log WHERE status = 'failed' ORDER BY created_at, seq",
                LOG_COLUMNS
            ),
            [],
        )
    }

    pub fn pending_count(&self) -> StorageResult<usize> {
        self.count_where("status != 'failed'")
    }

    pub fn failure_count(&self) -> StorageResult<usize> {
        self.count_where("status = 'failed'")
    }

    fn count_where(&self, condition: &str) -> StorageResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM mutation_log WHERE {}", condition);
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// A single log entry
    pub fn mutation(&self, mutation_id: MutationId) -> StorageResult<Option<MutationLogEntry>> {
        load_entry(&self.conn, mutation_id)
    }

    // ==================== Local writes ====================

    /// Record a local write for the active session and project it
    ///
    /// Refuses when no session is active or the store still holds another
    /// user's rows.
    pub fn record_mutation(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        operation: MutationOp,
        payload: Value,
    ) -> Result<Recorded> {
        let session = self.session()?.ok_or(Error::NoSession)?;
        let foreign = self.foreign_owners(&session.user_id)?;
        if !foreign.is_empty() {
            return Err(Error::Conflict {
                existing_owner: foreign.join(", "),
            });
        }

        Ok(self.record_at(
            &session.user_id,
            entity_type,
            entity_id,
            operation,
            payload,
            Utc::now(),
        )?)
    }

    pub(crate) fn record_at(
        &mut self,
        owner: &str,
        entity_type: EntityType,
        entity_id: &str,
        operation: MutationOp,
        payload: Value,
        now: DateTime<Utc>,
    ) -> StorageResult<Recorded> {
        let tx = self.conn.transaction()?;

        if operation == MutationOp::Delete {
            if let Some(dropped) = cancel_unsent_create(&tx, entity_type, entity_id)? {
                tx.commit()?;
                debug!(
                    "Delete of unsent {}/{} cancelled {} queued entries",
                    entity_type, entity_id, dropped
                );
                return Ok(Recorded::Cancelled { dropped });
            }
        }

        let mutation_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO mutation_log
                (mutation_id, entity_type, entity_id, owner_user_id, operation, payload,
                 created_at, attempts, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'pending')",
            params![
                mutation_id.to_string(),
                entity_type.as_str(),
                entity_id,
                owner,
                operation.as_str(),
                serde_json::to_string(&payload)?,
                to_millis(now),
            ],
        )?;
        reproject(&tx, entity_type, entity_id, owner)?;
        tx.commit()?;

        debug!(
            "Queued {} {} {}/{}",
            mutation_id, operation, entity_type, entity_id
        );
        Ok(Recorded::Queued(mutation_id))
    }

    // ==================== Upload bookkeeping ====================

    /// Claim a pending entry for upload
    ///
    /// Returns false when the entry is gone or no longer pending.
    pub fn mark_in_flight(&mut self, mutation_id: MutationId) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE mutation_log SET status = 'in_flight'
             WHERE mutation_id = ? AND status = 'pending'",
            [mutation_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Return an abandoned in-flight entry to the queue without counting an attempt
    pub fn release_in_flight(&mut self, mutation_id: MutationId) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE mutation_log SET status = 'pending'
             WHERE mutation_id = ? AND status = 'in_flight'",
            [mutation_id.to_string()],
        )?;
        Ok(())
    }

    /// Merge a server acknowledgement into the cache and drop the entry
    ///
    /// Returns false if the entry no longer exists.
    pub fn acknowledge(&mut self, mutation_id: MutationId, ack: &Acknowledgement) -> StorageResult<bool> {
        let tx = self.conn.transaction()?;
        let Some(entry) = load_entry(&tx, mutation_id)? else {
            return Ok(false);
        };

        tx.execute(
            "DELETE FROM mutation_log WHERE mutation_id = ?",
            [mutation_id.to_string()],
        )?;

        let row = load_entity(&tx, entry.entity_type, &entry.entity_id)?;
        let (previous, previous_version) = row.map_or((None, 0), |r| (r.server_payload, r.version));
        let version = ack.version.unwrap_or(previous_version + 1);

        let acknowledged = match entry.operation {
            MutationOp::Delete => None,
            _ => Some(ack.payload.clone().unwrap_or_else(|| {
                replay(previous, std::slice::from_ref(&entry)).unwrap_or(Value::Null)
            })),
        };

        upsert_entity(
            &tx,
            entry.entity_type,
            &entry.entity_id,
            acknowledged.as_ref().unwrap_or(&Value::Null),
            acknowledged.as_ref(),
            version,
            &entry.owner_user_id,
            &SyncState::Clean,
        )?;
        reproject(&tx, entry.entity_type, &entry.entity_id, &entry.owner_user_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Re-queue an entry after a retryable failure
    pub fn schedule_retry(
        &mut self,
        mutation_id: MutationId,
        attempts: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE mutation_log
             SET status = 'pending', attempts = ?, last_error = ?, next_attempt_at = ?
             WHERE mutation_id = ?",
            params![
                attempts,
                error,
                to_millis(next_attempt_at),
                mutation_id.to_string()
            ],
        )?;
        Ok(())
    }

    /// Move an entry to `failed` and mark its entity
    pub fn mark_failed(&mut self, mutation_id: MutationId, attempts: u32, reason: &str) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        let Some(entry) = load_entry(&tx, mutation_id)? else {
            return Ok(());
        };
        tx.execute(
            "UPDATE mutation_log
             SET status = 'failed', attempts = ?, last_error = ?, next_attempt_at = NULL
             WHERE mutation_id = ?",
            params![attempts, reason, mutation_id.to_string()],
        )?;
        reproject(&tx, entry.entity_type, &entry.entity_id, &entry.owner_user_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Put a failed entry back in the queue with a fresh attempt budget
    pub fn retry_failed(&mut self, mutation_id: MutationId) -> StorageResult<bool> {
        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            "UPDATE mutation_log
             SET status = 'pending', attempts = 0, last_error = NULL, next_attempt_at = NULL
             WHERE mutation_id = ? AND status = 'failed'",
            [mutation_id.to_string()],
        )?;
        if changed > 0 {
            if let Some(entry) = load_entry(&tx, mutation_id)? {
                reproject(&tx, entry.entity_type, &entry.entity_id, &entry.owner_user_id)?;
            }
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Drop a failed entry and re-derive what its entity shows
    pub fn discard_failed(&mut self, mutation_id: MutationId) -> StorageResult<bool> {
        let tx = self.conn.transaction()?;
        let entry = match load_entry(&tx, mutation_id)? {
            Some(entry) if entry.status == MutationStatus::Failed => entry,
            _ => return Ok(false),
        };
        tx.execute(
            "DELETE FROM mutation_log WHERE mutation_id = ?",
            [mutation_id.to_string()],
        )?;
        reproject(&tx, entry.entity_type, &entry.entity_id, &entry.owner_user_id)?;
        tx.commit()?;
        Ok(true)
    }

    /// Return entries stranded in flight by a crash to the queue
    pub fn reset_in_flight(&mut self) -> StorageResult<usize> {
        let count = self.conn.execute(
            "UPDATE mutation_log SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        Ok(count)
    }

    // ==================== Hydration ====================

    pub fn clear_staging(&mut self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM staged_entities", [])?;
        Ok(())
    }

    /// Add snapshot records to the staging area
    pub fn stage_records(
        &mut self,
        entity_type: EntityType,
        records: &[ServerRecord],
        owner: &str,
    ) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;
        let mut staged = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO staged_entities
                    (entity_type, entity_id, payload, version, owner_user_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in records.iter().filter(|r| !r.deleted) {
                stmt.execute(params![
                    entity_type.as_str(),
                    record.entity_id,
                    serde_json::to_string(&record.payload)?,
                    record.version,
                    owner,
                ])?;
                staged += 1;
            }
        }
        tx.commit()?;
        Ok(staged)
    }

    /// Atomically replace the live cache with the staging area
    ///
    /// Cursors are reset to `completed_at` for the hydrated types, and the
    /// owner's queued writes are replayed over the fresh rows.
    pub fn swap_staged(
        &mut self,
        owner: &str,
        types: &[EntityType],
        completed_at: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM cached_entities", [])?;
        let swapped = tx.execute(
            "INSERT INTO cached_entities
                (entity_type, entity_id, payload, server_payload, version, owner_user_id, sync_state, sync_error)
             SELECT entity_type, entity_id, payload, payload, version, owner_user_id, 'clean', NULL
             FROM staged_entities",
            [],
        )?;
        tx.execute("DELETE FROM staged_entities", [])?;

        tx.execute("DELETE FROM sync_cursors", [])?;
        for entity_type in types {
            tx.execute(
                "INSERT INTO sync_cursors (entity_type, last_synced_at, last_sync_token)
                 VALUES (?, ?, NULL)",
                params![entity_type.as_str(), to_millis(completed_at)],
            )?;
        }

        let logged: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT entity_type, entity_id FROM mutation_log WHERE owner_user_id = ?",
            )?;
            let rows = stmt.query_map([owner], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (entity_type, entity_id) in &logged {
            reproject(&tx, entity_type.parse()?, entity_id, owner)?;
        }

        tx.commit()?;
        info!(
            "Hydration swapped in {} entities ({} with queued local writes)",
            swapped,
            logged.len()
        );
        Ok(swapped)
    }

    // ==================== Pull ====================

    pub fn cursors(&self) -> StorageResult<Vec<SyncCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, last_synced_at, last_sync_token FROM sync_cursors ORDER BY entity_type",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(entity_type, at, token)| {
                Ok::<_, StorageError>(SyncCursor {
                    entity_type: entity_type.parse()?,
                    last_synced_at: at.map(from_millis).transpose()?,
                    last_sync_token: token,
                })
            })
            .collect()
    }

    pub fn cursor(&self, entity_type: EntityType) -> StorageResult<Option<SyncCursor>> {
        Ok(self
            .cursors()?
            .into_iter()
            .find(|c| c.entity_type == entity_type))
    }

    /// Apply pulled changes and advance the cursor in one transaction
    ///
    /// Entities with any log entry are skipped so a pull never overwrites
    /// a write the server hasn't seen. When anything was skipped the cursor
    /// is left where it was; the next pull fetches those records again.
    pub fn apply_pulled(
        &mut self,
        entity_type: EntityType,
        records: &[ServerRecord],
        owner: &str,
        cursor: &SyncCursor,
    ) -> StorageResult<PullApplied> {
        let tx = self.conn.transaction()?;
        let mut outcome = PullApplied::default();

        for record in records {
            if has_log_entries(&tx, entity_type, &record.entity_id)? {
                outcome.skipped += 1;
                continue;
            }

            if record.deleted {
                outcome.deleted += tx.execute(
                    "DELETE FROM cached_entities WHERE entity_type = ? AND entity_id = ?",
                    params![entity_type.as_str(), record.entity_id],
                )?;
                continue;
            }

            let current = load_entity(&tx, entity_type, &record.entity_id)?;
            if current.is_some_and(|c| c.version > record.version) {
                outcome.stale += 1;
                continue;
            }

            upsert_entity(
                &tx,
                entity_type,
                &record.entity_id,
                &record.payload,
                Some(&record.payload),
                record.version,
                owner,
                &SyncState::Clean,
            )?;
            outcome.applied += 1;
        }

        if outcome.skipped > 0 {
            outcome.cursor_held = true;
        } else {
            tx.execute(
                "INSERT OR REPLACE INTO sync_cursors (entity_type, last_synced_at, last_sync_token)
                 VALUES (?, ?, ?)",
                params![
                    entity_type.as_str(),
                    cursor.last_synced_at.map(to_millis),
                    cursor.last_sync_token,
                ],
            )?;
        }
        tx.commit()?;
        Ok(outcome)
    }
}

// ==================== Row helpers ====================

const ENTITY_COLUMNS: &str =
    "entity_type, entity_id, payload, server_payload, version, owner_user_id, sync_state, sync_error";

const LOG_COLUMNS: &str = "seq, mutation_id, entity_type, entity_id, owner_user_id, operation, \
     payload, created_at, attempts, last_error, next_attempt_at, status";

struct EntityRow {
    entity_type: String,
    entity_id: String,
    payload: String,
    server_payload: Option<String>,
    version: i64,
    owner_user_id: String,
    sync_state: String,
    sync_error: Option<String>,
}

impl EntityRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            payload: row.get(2)?,
            server_payload: row.get(3)?,
            version: row.get(4)?,
            owner_user_id: row.get(5)?,
            sync_state: row.get(6)?,
            sync_error: row.get(7)?,
        })
    }

    fn into_entity(self) -> StorageResult<CachedEntity> {
        Ok(CachedEntity {
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id,
            payload: serde_json::from_str(&self.payload)?,
            server_payload: self
                .server_payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            version: self.version,
            owner_user_id: self.owner_user_id,
            sync_state: SyncState::from_columns(&self.sync_state, self.sync_error)?,
        })
    }
}

struct LogRow {
    seq: i64,
    mutation_id: String,
    entity_type: String,
    entity_id: String,
    owner_user_id: String,
    operation: String,
    payload: String,
    created_at: i64,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    status: String,
}

impl LogRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            mutation_id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            owner_user_id: row.get(4)?,
            operation: row.get(5)?,
            payload: row.get(6)?,
            created_at: row.get(7)?,
            attempts: row.get(8)?,
            last_error: row.get(9)?,
            next_attempt_at: row.get(10)?,
            status: row.get(11)?,
        })
    }

    fn into_entry(self) -> StorageResult<MutationLogEntry> {
        Ok(MutationLogEntry {
            seq: self.seq,
            mutation_id: Uuid::parse_str(&self.mutation_id)
                .map_err(|e| StorageError::InvalidRow(format!("mutation id: {}", e)))?,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id,
            owner_user_id: self.owner_user_id,
            operation: self.operation.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            created_at: from_millis(self.created_at)?,
            attempts: self.attempts,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at.map(from_millis).transpose()?,
            status: self.status.parse()?,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::InvalidRow(format!("timestamp out of range: {}", millis)))
}

fn write_session(conn: &Connection, session: &Session) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO session (id, user_id, role, school_id, authenticated_at)
         VALUES (1, ?1, ?2, ?3, ?4)",
        params![
            session.user_id,
            session.role.as_str(),
            session.school_id,
            to_millis(session.authenticated_at),
        ],
    )?;
    Ok(())
}

fn wipe(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "DELETE FROM cached_entities;
         DELETE FROM staged_entities;
         DELETE FROM mutation_log;
         DELETE FROM sync_cursors;",
    )?;
    Ok(())
}

fn load_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> StorageResult<Option<CachedEntity>> {
    let sql = format!(
        "SELECT {} FROM cached_entities WHERE entity_type = ? AND entity_id = ?",
        ENTITY_COLUMNS
    );
    conn.query_row(&sql, params![entity_type.as_str(), entity_id], EntityRow::read)
        .optional()?
        .map(EntityRow::into_entity)
        .transpose()
}

fn load_entry(conn: &Connection, mutation_id: MutationId) -> StorageResult<Option<MutationLogEntry>> {
    let sql = format!("SELECT {} FROM mutation_log WHERE mutation_id = ?", LOG_COLUMNS);
    conn.query_row(&sql, [mutation_id.to_string()], LogRow::read)
        .optional()?
        .map(LogRow::into_entry)
        .transpose()
}

fn query_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<MutationLogEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, LogRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(LogRow::into_entry).collect()
}

fn entity_entries(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> StorageResult<Vec<MutationLogEntry>> {
    query_entries(
        conn,
        &format!(
            "SELECT {} FROM mutation_log
             WHERE entity_type = ? AND entity_id = ?
             ORDER BY created_at, seq",
            LOG_COLUMNS
        ),
        params![entity_type.as_str(), entity_id],
    )
}

fn has_log_entries(conn: &Connection, entity_type: EntityType, entity_id: &str) -> StorageResult<bool> {
    let exists = conn
        .prepare("SELECT 1 FROM mutation_log WHERE entity_type = ? AND entity_id = ? LIMIT 1")?
        .exists(params![entity_type.as_str(), entity_id])?;
    Ok(exists)
}

#[allow(clippy::too_many_arguments)]
fn upsert_entity(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    payload: &Value,
    server_payload: Option<&Value>,
    version: i64,
    owner: &str,
    state: &SyncState,
) -> StorageResult<()> {
    let (state, error) = state.to_columns();
    conn.execute(
        "INSERT INTO cached_entities
            (entity_type, entity_id, payload, server_payload, version, owner_user_id, sync_state, sync_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            payload = excluded.payload,
            server_payload = excluded.server_payload,
            version = excluded.version,
            owner_user_id = excluded.owner_user_id,
            sync_state = excluded.sync_state,
            sync_error = excluded.sync_error",
        params![
            entity_type.as_str(),
            entity_id,
            serde_json::to_string(payload)?,
            server_payload.map(serde_json::to_string).transpose()?,
            version,
            owner,
            state,
            error,
        ],
    )?;
    Ok(())
}

/// Drop a never-acknowledged create and everything queued after it
///
/// Returns the number of dropped entries, or None when the delete has to
/// be sent to the server.
fn cancel_unsent_create(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
) -> StorageResult<Option<usize>> {
    let entries = entity_entries(conn, entity_type, entity_id)?;
    let starts_with_create = entries
        .first()
        .is_some_and(|e| e.operation == MutationOp::Create);
    let in_flight = entries.iter().any(|e| e.status == MutationStatus::InFlight);
    let acknowledged = load_entity(conn, entity_type, entity_id)?
        .is_some_and(|row| row.server_payload.is_some());

    if !starts_with_create || in_flight || acknowledged {
        return Ok(None);
    }

    conn.execute(
        "DELETE FROM mutation_log WHERE entity_type = ? AND entity_id = ?",
        params![entity_type.as_str(), entity_id],
    )?;
    conn.execute(
        "DELETE FROM cached_entities WHERE entity_type = ? AND entity_id = ?",
        params![entity_type.as_str(), entity_id],
    )?;
    Ok(Some(entries.len()))
}

/// Re-derive an entity's visible payload and state from its log
fn reproject(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: &str,
    owner: &str,
) -> StorageResult<()> {
    let row = load_entity(conn, entity_type, entity_id)?;
    let entries = entity_entries(conn, entity_type, entity_id)?;
    let server_payload = row.as_ref().and_then(|r| r.server_payload.clone());
    let version = row.as_ref().map_or(0, |r| r.version);

    if entries.is_empty() {
        match (row, server_payload) {
            (Some(_), Some(server)) => upsert_entity(
                conn,
                entity_type,
                entity_id,
                &server,
                Some(&server),
                version,
                owner,
                &SyncState::Clean,
            )?,
            (Some(_), None) => {
                conn.execute(
                    "DELETE FROM cached_entities WHERE entity_type = ? AND entity_id = ?",
                    params![entity_type.as_str(), entity_id],
                )?;
            }
            (None, _) => {}
        }
        return Ok(());
    }

    let state = derive_state(server_payload.is_some(), &entries);
    let view = replay(server_payload.clone(), &entries).unwrap_or(Value::Null);
    upsert_entity(
        conn,
        entity_type,
        entity_id,
        &view,
        server_payload.as_ref(),
        version,
        owner,
        &state,
    )
}

/// Fold log entries over a base payload, oldest first
fn replay(base: Option<Value>, entries: &[MutationLogEntry]) -> Option<Value> {
    entries.iter().fold(base, |view, entry| match entry.operation {
        MutationOp::Create => Some(entry.payload.clone()),
        MutationOp::Update => Some(match view {
            Some(current) => merge(current, &entry.payload),
            None => entry.payload.clone(),
        }),
        MutationOp::Delete => view,
    })
}

/// Shallow merge of an update into the current payload
fn merge(current: Value, patch: &Value) -> Value {
    match (current, patch) {
        (Value::Object(mut target), Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
            Value::Object(target)
        }
        (_, patch) => patch.clone(),
    }
}

fn derive_state(acknowledged: bool, entries: &[MutationLogEntry]) -> SyncState {
    if let Some(failed) = entries.iter().find(|e| e.status == MutationStatus::Failed) {
        return SyncState::Failed(
            failed
                .last_error
                .clone()
                .unwrap_or_else(|| "rejected by server".to_string()),
        );
    }

    let first = entries.first().map(|e| e.operation);
    match entries.last().map(|e| e.operation) {
        Some(MutationOp::Delete) => SyncState::Pending(MutationOp::Delete),
        _ if !acknowledged && first == Some(MutationOp::Create) => {
            SyncState::Pending(MutationOp::Create)
        }
        _ => SyncState::Pending(MutationOp::Update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    const TEACHER: &str = "teacher-7";

    fn store_for(user: &str) -> LocalStore {
        let mut store = LocalStore::open_in_memory().unwrap();
        store
            .begin_session(&Session::new(user, Role::Teacher, "school-1"), false)
            .unwrap();
        store
    }

    fn queued(recorded: Recorded) -> MutationId {
        match recorded {
            Recorded::Queued(id) => id,
            other => panic!("expected a queued mutation, got {:?}", other),
        }
    }

    fn hydrate(store: &mut LocalStore, owner: &str, entity_type: EntityType, records: &[ServerRecord]) {
        store.stage_records(entity_type, records, owner).unwrap();
        store.swap_staged(owner, &[entity_type], Utc::now()).unwrap();
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("classync.db");

        let id = {
            let mut store = LocalStore::open_path(&path).unwrap();
            store
                .begin_session(&Session::new(TEACHER, Role::Teacher, "school-1"), false)
                .unwrap();
            queued(
                store
                    .record_mutation(
                        EntityType::Marks,
                        "M1",
                        MutationOp::Create,
                        json!({"score": 81}),
                    )
                    .unwrap(),
            )
        };

        let store = LocalStore::open_path(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(store.session().unwrap().unwrap().user_id, TEACHER);
        let log = store.mutation_log().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].mutation_id, id);
    }

    #[test]
    fn test_open_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().join("nested").join("data"),
            ..Config::default()
        };
        let store = LocalStore::open(&config).unwrap();
        assert!(config.sqlite_path().exists());
        assert!(store.session().unwrap().is_none());
    }

    #[test]
    fn test_record_requires_session() {
        let mut store = LocalStore::open_in_memory().unwrap();
        let err = store
            .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::NoSession));
    }

    #[test]
    fn test_record_refuses_mixed_ownership() {
        let mut store = store_for("teacher-42");
        hydrate(
            &mut store,
            "teacher-42",
            EntityType::Classes,
            &[ServerRecord::new("C1", json!({"name": "7B"}))],
        );
        store
            .begin_session(&Session::new(TEACHER, Role::Teacher, "school-1"), false)
            .unwrap();

        let err = store
            .record_mutation(EntityType::Classes, "C1", MutationOp::Update, json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { ref existing_owner } if existing_owner == "teacher-42"));
    }

    #[test]
    fn test_optimistic_create_is_visible() {
        let mut store = store_for(TEACHER);
        store
            .record_mutation(
                EntityType::Attendance,
                "S1-C1-2024-05-01",
                MutationOp::Create,
                json!({"status": "present"}),
            )
            .unwrap();

        let row = store
            .entity(EntityType::Attendance, "S1-C1-2024-05-01")
            .unwrap()
            .unwrap();
        assert_eq!(row.payload, json!({"status": "present"}));
        assert_eq!(row.sync_state, SyncState::Pending(MutationOp::Create));
        assert_eq!(row.owner_user_id, TEACHER);
        assert!(row.server_payload.is_none());
    }

    #[test]
    fn test_later_write_supersedes_for_display() {
        let mut store = store_for(TEACHER);
        let first = queued(
            store
                .record_mutation(
                    EntityType::Attendance,
                    "S1-C1-2024-05-01",
                    MutationOp::Create,
                    json!({"status": "present"}),
                )
                .unwrap(),
        );
        let second = queued(
            store
                .record_mutation(
                    EntityType::Attendance,
                    "S1-C1-2024-05-01",
                    MutationOp::Create,
                    json!({"status": "absent"}),
                )
                .unwrap(),
        );
        assert_ne!(first, second);

        let row = store
            .entity(EntityType::Attendance, "S1-C1-2024-05-01")
            .unwrap()
            .unwrap();
        assert_eq!(row.payload["status"], "absent");

        let log = store.pending_mutations().unwrap();
        let ids: Vec<_> = log.iter().map(|e| e.mutation_id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let mut store = store_for(TEACHER);
        let at = Utc::now();
        let a = queued(
            store
                .record_at(TEACHER, EntityType::Marks, "M1", MutationOp::Create, json!({"score": 1}), at)
                .unwrap(),
        );
        let b = queued(
            store
                .record_at(TEACHER, EntityType::Marks, "M1", MutationOp::Update, json!({"score": 2}), at)
                .unwrap(),
        );
        let ids: Vec<_> = store.mutation_log().unwrap().iter().map(|e| e.mutation_id).collect();
        assert_eq!(ids, vec![a, b]);
        let row = store.entity(EntityType::Marks, "M1").unwrap().unwrap();
        assert_eq!(row.payload["score"], 2);
    }

    #[test]
    fn test_update_merges_and_stays_pending_create() {
        let mut store = store_for(TEACHER);
        store
            .record_mutation(
                EntityType::Students,
                "S9",
                MutationOp::Create,
                json!({"name": "Ada", "grade": 7}),
            )
            .unwrap();
        store
            .record_mutation(EntityType::Students, "S9", MutationOp::Update, json!({"grade": 8}))
            .unwrap();

        let row = store.entity(EntityType::Students, "S9").unwrap().unwrap();
        assert_eq!(row.payload, json!({"name": "Ada", "grade": 8}));
        assert_eq!(row.sync_state, SyncState::Pending(MutationOp::Create));
    }

    #[test]
    fn test_delete_of_pending_create_cancels_locally() {
        let mut store = store_for(TEACHER);
        store
            .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({"score": 40}))
            .unwrap();
        store
            .record_mutation(EntityType::Marks, "M1", MutationOp::Update, json!({"score": 45}))
            .unwrap();

        let outcome = store
            .record_mutation(EntityType::Marks, "M1", MutationOp::Delete, Value::Null)
            .unwrap();
        assert_eq!(outcome, Recorded::Cancelled { dropped: 2 });
        assert!(store.entity(EntityType::Marks, "M1").unwrap().is_none());
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_delete_of_in_flight_create_is_queued() {
        let mut store = store_for(TEACHER);
        let create = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({"score": 40}))
                .unwrap(),
        );
        store.mark_in_flight(create).unwrap();

        let outcome = store
            .record_mutation(EntityType::Marks, "M1", MutationOp::Delete, Value::Null)
            .unwrap();
        assert!(matches!(outcome, Recorded::Queued(_)));
        assert_eq!(store.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_delete_of_cached_entity_hides_it() {
        let mut store = store_for(TEACHER);
        hydrate(
            &mut store,
            TEACHER,
            EntityType::Students,
            &[
                ServerRecord::new("S1", json!({"name": "Ada"})),
                ServerRecord::new("S2", json!({"name": "Grace"})),
            ],
        );

        store
            .record_mutation(EntityType::Students, "S1", MutationOp::Delete, Value::Null)
            .unwrap();

        let row = store.entity(EntityType::Students, "S1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Pending(MutationOp::Delete));
        let visible = store.entities(EntityType::Students).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].entity_id, "S2");

        let counts = store.entity_counts().unwrap();
        assert!(counts.contains(&(EntityType::Students, 1)));
    }

    #[test]
    fn test_acknowledgements_merge_in_order() {
        let mut store = store_for(TEACHER);
        let first = queued(
            store
                .record_mutation(
                    EntityType::Attendance,
                    "A1",
                    MutationOp::Create,
                    json!({"status": "present"}),
                )
                .unwrap(),
        );
        let second = queued(
            store
                .record_mutation(
                    EntityType::Attendance,
                    "A1",
                    MutationOp::Update,
                    json!({"status": "late"}),
                )
                .unwrap(),
        );

        assert!(store.acknowledge(first, &Acknowledgement::default()).unwrap());
        let row = store.entity(EntityType::Attendance, "A1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Pending(MutationOp::Update));
        assert_eq!(row.server_payload, Some(json!({"status": "present"})));
        assert_eq!(row.payload["status"], "late");
        assert_eq!(row.version, 1);

        let ack = Acknowledgement {
            version: Some(9),
            payload: Some(json!({"status": "late", "markedBy": TEACHER})),
        };
        assert!(store.acknowledge(second, &ack).unwrap());
        let row = store.entity(EntityType::Attendance, "A1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Clean);
        assert_eq!(row.payload["markedBy"], TEACHER);
        assert_eq!(row.version, 9);

        // Replayed acknowledgement is a no-op
        assert!(!store.acknowledge(second, &ack).unwrap());
    }

    #[test]
    fn test_acknowledged_delete_removes_row() {
        let mut store = store_for(TEACHER);
        hydrate(
            &mut store,
            TEACHER,
            EntityType::Subjects,
            &[ServerRecord::new("SUB1", json!({"name": "Maths"}))],
        );
        let delete = queued(
            store
                .record_mutation(EntityType::Subjects, "SUB1", MutationOp::Delete, Value::Null)
                .unwrap(),
        );

        store.acknowledge(delete, &Acknowledgement::default()).unwrap();
        assert!(store.entity(EntityType::Subjects, "SUB1").unwrap().is_none());
    }

    #[test]
    fn test_failed_entry_marks_entity_and_can_be_retried() {
        let mut store = store_for(TEACHER);
        let id = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({"score": 140}))
                .unwrap(),
        );

        store.mark_failed(id, 1, "marks must be at most 100").unwrap();
        let row = store.entity(EntityType::Marks, "M1").unwrap().unwrap();
        assert_eq!(
            row.sync_state,
            SyncState::Failed("marks must be at most 100".to_string())
        );
        assert_eq!(store.failure_count().unwrap(), 1);
        assert_eq!(store.pending_count().unwrap(), 0);

        assert!(store.retry_failed(id).unwrap());
        let entry = store.mutation(id).unwrap().unwrap();
        assert_eq!(entry.status, MutationStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert!(entry.last_error.is_none());
        let row = store.entity(EntityType::Marks, "M1").unwrap().unwrap();
        assert_eq!(row.sync_state, SyncState::Pending(MutationOp::Create));

        // Only failed entries can be retried
        assert!(!store.retry_failed(id).unwrap());
    }

    #[test]
    fn test_discard_failed_reverts_to_server_payload() {
        let mut store = store_for(TEACHER);
        hydrate(
            &mut store,
            TEACHER,
            EntityType::Marks,
            &[ServerRecord::new("M1", json!({"score": 60}))],
        );
        let id = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Update, json!({"score": 160}))
                .unwrap(),
        );
        store.mark_failed(id, 1, "out of range").unwrap();

        assert!(store.discard_failed(id).unwrap());
        let row = store.entity(EntityType::Marks, "M1").unwrap().unwrap();
        assert_eq!(row.payload, json!({"score": 60}));
        assert_eq!(row.sync_state, SyncState::Clean);
        assert_eq!(store.failure_count().unwrap(), 0);
    }

    #[test]
    fn test_discard_failed_create_drops_row() {
        let mut store = store_for(TEACHER);
        let id = queued(
            store
                .record_mutation(EntityType::Marks, "M2", MutationOp::Create, json!({"score": 101}))
                .unwrap(),
        );
        store.mark_failed(id, 1, "out of range").unwrap();
        assert!(store.discard_failed(id).unwrap());
        assert!(store.entity(EntityType::Marks, "M2").unwrap().is_none());

        // Pending entries are not discardable
        let pending = queued(
            store
                .record_mutation(EntityType::Marks, "M3", MutationOp::Create, json!({"score": 5}))
                .unwrap(),
        );
        assert!(!store.discard_failed(pending).unwrap());
    }

    #[test]
    fn test_schedule_retry_gates_entry() {
        let mut store = store_for(TEACHER);
        let id = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({"score": 70}))
                .unwrap(),
        );
        store.mark_in_flight(id).unwrap();

        let now = Utc::now();
        store
            .schedule_retry(id, 1, "timed out", now + Duration::seconds(2))
            .unwrap();

        let entry = store.mutation(id).unwrap().unwrap();
        assert_eq!(entry.status, MutationStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("timed out"));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + Duration::seconds(3)));
    }

    #[test]
    fn test_mark_in_flight_claims_only_pending_entries() {
        let mut store = store_for(TEACHER);
        let create = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({"score": 10}))
                .unwrap(),
        );

        assert!(store.mark_in_flight(create).unwrap());
        assert!(!store.mark_in_flight(create).unwrap());

        let unsent = queued(
            store
                .record_mutation(EntityType::Marks, "M2", MutationOp::Create, json!({"score": 20}))
                .unwrap(),
        );
        store
            .record_mutation(EntityType::Marks, "M2", MutationOp::Delete, Value::Null)
            .unwrap();
        assert!(!store.mark_in_flight(unsent).unwrap());
        assert!(store.mutation(unsent).unwrap().is_none());
    }

    #[test]
    fn test_reset_and_release_in_flight() {
        let mut store = store_for(TEACHER);
        let a = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Create, json!({}))
                .unwrap(),
        );
        let b = queued(
            store
                .record_mutation(EntityType::Marks, "M2", MutationOp::Create, json!({}))
                .unwrap(),
        );
        store.mark_in_flight(a).unwrap();
        store.mark_in_flight(b).unwrap();

        store.release_in_flight(a).unwrap();
        let entry = store.mutation(a).unwrap().unwrap();
        assert_eq!(entry.status, MutationStatus::Pending);
        assert_eq!(entry.attempts, 0);

        assert_eq!(store.reset_in_flight().unwrap(), 1);
        assert_eq!(
            store.mutation(b).unwrap().unwrap().status,
            MutationStatus::Pending
        );
    }

    #[test]
    fn test_swap_replaces_live_set_and_replays_local_writes() {
        let mut store = store_for(TEACHER);
        hydrate(
            &mut store,
            TEACHER,
            EntityType::Classes,
            &[ServerRecord::new("OLD", json!({"name": "gone"}))],
        );
        store
            .record_mutation(EntityType::Classes, "C1", MutationOp::Update, json!({"room": "12"}))
            .unwrap();

        store.clear_staging().unwrap();
        store
            .stage_records(
                EntityType::Classes,
                &[
                    ServerRecord::new("C1", json!({"name": "7B", "room": "3"})),
                    ServerRecord::tombstone("C2"),
                ],
                TEACHER,
            )
            .unwrap();
        let completed = Utc::now();
        let swapped = store
            .swap_staged(TEACHER, &[EntityType::Classes, EntityType::Students], completed)
            .unwrap();
        assert_eq!(swapped, 1);

        assert!(store.entity(EntityType::Classes, "OLD").unwrap().is_none());
        let row = store.entity(EntityType::Classes, "C1").unwrap().unwrap();
        assert_eq!(row.payload, json!({"name": "7B", "room": "12"}));
        assert_eq!(row.server_payload, Some(json!({"name": "7B", "room": "3"})));
        assert_eq!(row.sync_state, SyncState::Pending(MutationOp::Update));

        let cursors = store.cursors().unwrap();
        assert_eq!(cursors.len(), 2);
        assert!(cursors
            .iter()
            .all(|c| c.last_synced_at.map(|t| t.timestamp_millis()) == Some(completed.timestamp_millis())));
    }

    #[test]
    fn test_pull_never_clobbers_local_writes() {
        let mut store = store_for(TEACHER);
        hydrate(
            &mut store,
            TEACHER,
            EntityType::Marks,
            &[
                ServerRecord::new("M1", json!({"score": 50})),
                ServerRecord::new("M2", json!({"score": 60})),
                ServerRecord::new("M3", json!({"score": 70})),
            ],
        );
        let edit = queued(
            store
                .record_mutation(EntityType::Marks, "M1", MutationOp::Update, json!({"score": 55}))
                .unwrap(),
        );

        let mut newer = ServerRecord::new("M1", json!({"score": 99}));
        newer.version = 5;
        let mut m2 = ServerRecord::new("M2", json!({"score": 65}));
        m2.version = 2;
        let mut old = ServerRecord::new("M4", json!({"score": 1}));
        old.version = 1;

        let cursor = SyncCursor {
            entity_type: EntityType::Marks,
            last_synced_at: Some(Utc::now()),
            last_sync_token: Some("tok-2".to_string()),
        };
        let outcome = store
            .apply_pulled(
                EntityType::Marks,
                &[newer.clone(), m2, ServerRecord::tombstone("M3"), old],
                TEACHER,
                &cursor,
            )
            .unwrap();

        assert_eq!(
            outcome,
            PullApplied {
                applied: 2,
                deleted: 1,
                skipped: 1,
                stale: 0,
                cursor_held: true,
            }
        );
        let m1 = store.entity(EntityType::Marks, "M1").unwrap().unwrap();
        assert_eq!(m1.payload["score"], 55);
        assert!(m1.sync_state.is_pending());
        assert_eq!(
            store.entity(EntityType::Marks, "M2").unwrap().unwrap().payload["score"],
            65
        );
        assert!(store.entity(EntityType::Marks, "M3").unwrap().is_none());

        // M1's server change is still owed, so the cursor stays put
        let stored = store.cursor(EntityType::Marks).unwrap().unwrap();
        assert!(stored.last_sync_token.is_none());

        // Once the local write is gone the same records apply and the cursor moves
        store.mark_failed(edit, 1, "rejected").unwrap();
        assert!(store.discard_failed(edit).unwrap());
        let outcome = store
            .apply_pulled(EntityType::Marks, &[newer], TEACHER, &cursor)
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert!(!outcome.cursor_held);

        let m1 = store.entity(EntityType::Marks, "M1").unwrap().unwrap();
        assert_eq!(m1.payload["score"], 99);
        assert_eq!(m1.version, 5);
        assert_eq!(m1.sync_state, SyncState::Clean);
        let stored = store.cursor(EntityType::Marks).unwrap().unwrap();
        assert_eq!(stored.last_sync_token.as_deref(), Some("tok-2"));
    }

    #[test]
    fn test_pull_skips_stale_versions() {
        let mut store = store_for(TEACHER);
        let mut current = ServerRecord::new("S1", json!({"name": "Ada Lovelace"}));
        current.version = 4;
        hydrate(&mut store, TEACHER, EntityType::Students, &[current]);

        let mut older = ServerRecord::new("S1", json!({"name": "Ada"}));
        older.version = 3;
        let cursor = SyncCursor {
            entity_type: EntityType::Students,
            last_synced_at: None,
            last_sync_token: None,
        };
        let outcome = store
            .apply_pulled(EntityType::Students, &[older], TEACHER, &cursor)
            .unwrap();
        assert_eq!(outcome.stale, 1);
        assert_eq!(
            store.entity(EntityType::Students, "S1").unwrap().unwrap().payload["name"],
            "Ada Lovelace"
        );
    }

    #[test]
    fn test_begin_session_with_clear_wipes_everything() {
        let mut store = store_for("teacher-42");
        hydrate(
            &mut store,
            "teacher-42",
            EntityType::Classes,
            &[ServerRecord::new("C1", json!({}))],
        );
        store
            .record_mutation(EntityType::Classes, "C1", MutationOp::Update, json!({"x": 1}))
            .unwrap();

        store
            .begin_session(&Session::new(TEACHER, Role::Teacher, "school-1"), true)
            .unwrap();

        assert!(store.foreign_owners(TEACHER).unwrap().is_empty());
        assert!(store.mutation_log().unwrap().is_empty());
        assert!(store.cursors().unwrap().is_empty());
        assert_eq!(store.session().unwrap().unwrap().user_id, TEACHER);
    }

    #[test]
    fn test_end_session_keeps_data() {
        let mut store = store_for(TEACHER);
        hydrate(
            &mut store,
            TEACHER,
            EntityType::Classes,
            &[ServerRecord::new("C1", json!({}))],
        );
        store.end_session().unwrap();
        assert!(store.session().unwrap().is_none());
        assert_eq!(store.entities(EntityType::Classes).unwrap().len(), 1);
    }

    #[test]
    fn test_merge_replaces_non_objects() {
        assert_eq!(merge(json!({"a": 1}), &json!({"b": 2})), json!({"a": 1, "b": 2}));
        assert_eq!(merge(json!("text"), &json!({"b": 2})), json!({"b": 2}));
        assert_eq!(merge(json!({"a": 1}), &json!(5)), json!(5));
    }
}
