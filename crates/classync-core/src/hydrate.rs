//! Cache hydration
//!
//! Pulls the role-scoped snapshot for the active session into the local
//! cache. Every list is drained page by page into a staging table; only
//! when all fetches succeed is the staging area swapped into the live
//! cache, so a failed hydration leaves the previous cache untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{with_timeout, ApiError, BackendApi, Scope, SnapshotRequest};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{EntityType, Role, ServerRecord, Session};
use crate::session::require_owner;
use crate::store::{lock_store, SharedStore};
use crate::sync::SyncGate;

const PRINCIPAL_TYPES: [EntityType; 4] = [
    EntityType::Classes,
    EntityType::Students,
    EntityType::Teachers,
    EntityType::Subjects,
];

const TEACHER_TYPES: [EntityType; 5] = [
    EntityType::Classes,
    EntityType::Students,
    EntityType::Subjects,
    EntityType::Attendance,
    EntityType::Marks,
];

/// What a completed hydration put into the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HydrationReport {
    /// Records staged per entity type, in fetch order
    pub staged: Vec<(EntityType, usize)>,
    /// Rows in the live cache after the swap
    pub swapped: usize,
    pub pages: usize,
}

impl HydrationReport {
    fn add(&mut self, entity_type: EntityType, count: usize) {
        match self.staged.iter_mut().find(|(t, _)| *t == entity_type) {
            Some((_, total)) => *total += count,
            None => self.staged.push((entity_type, count)),
        }
    }

    pub fn total(&self) -> usize {
        self.staged.iter().map(|(_, n)| n).sum()
    }
}

/// Downloads role-scoped snapshots into the local store
pub struct CacheHydrator {
    store: SharedStore,
    backend: Arc<dyn BackendApi>,
    gate: SyncGate,
    page_size: u32,
    request_timeout: Duration,
}

impl CacheHydrator {
    pub fn new(
        store: SharedStore,
        backend: Arc<dyn BackendApi>,
        gate: SyncGate,
        config: &Config,
    ) -> Self {
        Self {
            store,
            backend,
            gate,
            page_size: config.page_size.max(1),
            request_timeout: config.request_timeout(),
        }
    }

    /// Hydrate whatever the active session's role calls for
    pub async fn hydrate_session(&self) -> Result<HydrationReport> {
        let session = lock_store(&self.store)?.session()?.ok_or(Error::NoSession)?;
        match session.role {
            Role::Principal => self.hydrate_principal(&session.school_id).await,
            Role::Teacher => self.hydrate_teacher(&session.user_id).await,
        }
    }

    /// School-wide classes, students, teachers and subjects
    pub async fn hydrate_principal(&self, school_id: &str) -> Result<HydrationReport> {
        let _gate = self.gate.lock().await;
        let session = self.owner_for(|s| s.role == Role::Principal && s.school_id == school_id)?;
        info!("Hydrating school {} for {}", school_id, session.user_id);

        self.begin()?;
        let fetched = self.fetch_school(school_id, &session.user_id).await;
        self.commit(&session, &PRINCIPAL_TYPES, fetched)
    }

    /// The teacher's classes, each class's students, attendance and marks,
    /// and the teacher's subjects
    pub async fn hydrate_teacher(&self, user_id: &str) -> Result<HydrationReport> {
        let _gate = self.gate.lock().await;
        let session = self.owner_for(|s| s.role == Role::Teacher && s.user_id == user_id)?;
        info!("Hydrating classes of {}", user_id);

        self.begin()?;
        let fetched = self.fetch_teacher(user_id).await;
        self.commit(&session, &TEACHER_TYPES, fetched)
    }

    async fn fetch_school(&self, school_id: &str, owner: &str) -> Result<HydrationReport> {
        let mut report = HydrationReport::default();
        let scope = Scope::School(school_id.to_string());
        for entity_type in PRINCIPAL_TYPES {
            self.drain(entity_type, &scope, owner, &mut report).await?;
        }
        Ok(report)
    }

    async fn fetch_teacher(&self, user_id: &str) -> Result<HydrationReport> {
        let mut report = HydrationReport::default();
        let teacher = Scope::Teacher(user_id.to_string());
        let classes = self
            .drain(EntityType::Classes, &teacher, user_id, &mut report)
            .await?;

        for class in &classes {
            let scope = Scope::Class(class.entity_id.clone());
            for entity_type in [EntityType::Students, EntityType::Attendance, EntityType::Marks] {
                self.drain(entity_type, &scope, user_id, &mut report).await?;
            }
        }

        self.drain(EntityType::Subjects, &teacher, user_id, &mut report)
            .await?;
        Ok(report)
    }

    /// Active session, provided it matches the requested scope
    fn owner_for(&self, matches: impl Fn(&Session) -> bool) -> Result<Session> {
        let session = require_owner(&*lock_store(&self.store)?)?;
        if !matches(&session) {
            return Err(Error::Conflict {
                existing_owner: format!("{} ({})", session.user_id, session.role),
            });
        }
        Ok(session)
    }

    fn begin(&self) -> Result<()> {
        lock_store(&self.store)?.clear_staging()?;
        Ok(())
    }

    /// Swap staging in on success; discard it on failure
    fn commit(
        &self,
        session: &Session,
        types: &[EntityType],
        fetched: Result<HydrationReport>,
    ) -> Result<HydrationReport> {
        let mut store = lock_store(&self.store)?;
        let mut report = match fetched {
            Ok(report) => report,
            Err(e) => {
                warn!("Hydration for {} failed: {}", session.user_id, e);
                store.clear_staging()?;
                return Err(e);
            }
        };

        report.swapped = store.swap_staged(&session.user_id, types, Utc::now())?;
        info!(
            "Hydration for {} complete: {} records in {} pages",
            session.user_id,
            report.total(),
            report.pages
        );
        Ok(report)
    }

    /// Drain one paginated list into staging; returns the live records
    async fn drain(
        &self,
        entity_type: EntityType,
        scope: &Scope,
        owner: &str,
        report: &mut HydrationReport,
    ) -> Result<Vec<ServerRecord>> {
        let mut page = 1;
        let mut drained = Vec::new();

        loop {
            let request = SnapshotRequest {
                entity_type,
                scope: scope.clone(),
                page,
                limit: self.page_size,
            };
            let fetched = with_timeout(self.request_timeout, self.backend.fetch_snapshot_page(&request))
                .await
                .map_err(|source| hydration_error(entity_type, source))?;

            let staged =
                lock_store(&self.store)?.stage_records(entity_type, &fetched.items, owner)?;
            debug!(
                "Staged {} {} (page {} of {:?})",
                staged, entity_type, fetched.page, fetched.total_pages
            );
            report.add(entity_type, staged);
            report.pages += 1;

            let last = fetched.is_last(self.page_size) || fetched.items.is_empty();
            drained.extend(fetched.items.into_iter().filter(|r| !r.deleted));
            if last {
                break;
            }
            page += 1;
        }

        Ok(drained)
    }
}

fn hydration_error(entity_type: EntityType, source: ApiError) -> Error {
    Error::Hydration {
        entity_type,
        source,
    }
}
