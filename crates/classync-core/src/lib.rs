//! Classync Core Library
//!
//! Device-local cache and sync engine for a school attendance and marks
//! client. The device works offline against a SQLite cache; local writes go
//! to a durable mutation log and are reconciled with the backend in the
//! background.
//!
//! # Architecture
//!
//! - **Session guard**: keeps one user's data from mixing with another's
//!   on a shared device
//! - **Cache hydrator**: downloads the role-scoped snapshot, all-or-nothing
//! - **Local store**: cache, mutation log and sync cursors in SQLite
//! - **Sync scheduler**: uploads the log and pulls changes on a timer, on
//!   reconnect, or on demand
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = store::shared(LocalStore::open(&config)?);
//! let backend = Arc::new(HttpBackend::new(url, credentials, config.request_timeout())?);
//! let mut service = SyncService::new(config, store, backend);
//!
//! service.activate(&session).await?;
//! service.hydrate_session().await?;
//! service.init()?;
//!
//! service.record_mutation(EntityType::Attendance, "S1-C1-2024-05-01",
//!     MutationOp::Create, json!({"status": "present"}))?;
//! ```
//!
//! # Modules
//!
//! - `service`: Application-facing entry point
//! - `session`: Identity conflict detection and resolution
//! - `hydrate`: Snapshot download
//! - `store`: Local cache and mutation log
//! - `sync`: Sync engine and scheduler
//! - `connectivity`: Online/offline feed
//! - `api`: Backend boundary and HTTP client
//! - `storage`: SQLite schema and error classification
//! - `config`: Application configuration

pub mod api;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod hydrate;
pub mod models;
pub mod service;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::{ApiError, BackendApi, CredentialStore, HttpBackend, StaticToken};
pub use config::Config;
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use error::{Error, Result};
pub use hydrate::{CacheHydrator, HydrationReport};
pub use models::{
    CachedEntity, EntityType, MutationId, MutationLogEntry, MutationOp, MutationStatus, Role,
    ServerRecord, Session, SyncCursor, SyncState,
};
pub use service::{SyncService, SyncStatus};
pub use session::{ConflictCheck, Resolution, SessionGuard};
pub use storage::StorageError;
pub use store::{LocalStore, Recorded, SharedStore};
pub use sync::{CycleReport, SchedulerEvent, SchedulerState, SyncEngine, SyncScheduler};
