//! Scripted in-memory backend for tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{
    Acknowledgement, ApiError, BackendApi, ChangesRequest, MutationRequest, Page, Scope,
    SnapshotRequest,
};
use crate::models::{EntityType, MutationId, MutationOp, Role, ServerRecord, Session};
use crate::store::{shared, LocalStore, SharedStore};

/// Scripted outcome for the next upload
#[derive(Debug, Clone)]
pub(crate) enum PushStep {
    /// Don't apply; answer with this error
    Fail(ApiError),
    /// Apply, then lose the response
    ApplyThenFail(ApiError),
    /// Wait before answering normally
    Delay(Duration),
}

#[derive(Default)]
struct FakeState {
    snapshots: HashMap<(EntityType, Scope), Vec<ServerRecord>>,
    snapshot_failures: HashMap<EntityType, ApiError>,
    changes: HashMap<EntityType, (Vec<ServerRecord>, Option<String>)>,
    change_failures: HashMap<EntityType, ApiError>,
    change_requests: Vec<ChangesRequest>,
    push_script: VecDeque<PushStep>,
    pushes: Vec<MutationRequest>,
    applied: Vec<MutationId>,
    seen: HashSet<MutationId>,
    records: HashMap<(EntityType, String), (Value, i64)>,
    healthy: bool,
}

/// Backend double that behaves like an idempotent server
pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                healthy: true,
                ..FakeState::default()
            }),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_snapshot(&self, entity_type: EntityType, scope: Scope, records: Vec<ServerRecord>) {
        self.with(|s| {
            s.snapshots.insert((entity_type, scope), records);
        });
    }

    pub fn fail_snapshot(&self, entity_type: EntityType, error: ApiError) {
        self.with(|s| {
            s.snapshot_failures.insert(entity_type, error);
        });
    }

    pub fn set_changes(&self, entity_type: EntityType, records: Vec<ServerRecord>, token: &str) {
        self.with(|s| {
            s.changes
                .insert(entity_type, (records, Some(token.to_string())));
        });
    }

    pub fn fail_changes(&self, entity_type: EntityType, error: ApiError) {
        self.with(|s| {
            s.change_failures.insert(entity_type, error);
        });
    }

    pub fn script_push(&self, steps: impl IntoIterator<Item = PushStep>) {
        self.with(|s| s.push_script.extend(steps));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.with(|s| s.healthy = healthy);
    }

    /// Every upload attempt, including failed ones
    pub fn pushes(&self) -> Vec<MutationRequest> {
        self.with(|s| s.pushes.clone())
    }

    /// Mutations the server applied, in order
    pub fn applied(&self) -> Vec<MutationId> {
        self.with(|s| s.applied.clone())
    }

    pub fn change_requests(&self) -> Vec<ChangesRequest> {
        self.with(|s| s.change_requests.clone())
    }

    pub fn server_value(&self, entity_type: EntityType, entity_id: &str) -> Option<Value> {
        self.with(|s| {
            s.records
                .get(&(entity_type, entity_id.to_string()))
                .map(|(value, _)| value.clone())
        })
    }

    pub fn server_record_count(&self) -> usize {
        self.with(|s| s.records.len())
    }

    fn apply(state: &mut FakeState, request: &MutationRequest) -> Acknowledgement {
        let key = (request.entity_type, request.entity_id.clone());
        if state.seen.insert(request.mutation_id) {
            state.applied.push(request.mutation_id);
            match request.operation {
                MutationOp::Delete => {
                    state.records.remove(&key);
                }
                MutationOp::Create => {
                    let version = state.records.get(&key).map_or(0, |(_, v)| *v) + 1;
                    state
                        .records
                        .insert(key.clone(), (request.payload.clone(), version));
                }
                MutationOp::Update => {
                    let (mut value, version) = state
                        .records
                        .remove(&key)
                        .unwrap_or((Value::Object(Default::default()), 0));
                    if let (Value::Object(target), Value::Object(fields)) =
                        (&mut value, &request.payload)
                    {
                        for (k, v) in fields {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                    state.records.insert(key.clone(), (value, version + 1));
                }
            }
        }

        match state.records.get(&key) {
            Some((value, version)) => Acknowledgement {
                version: Some(*version),
                payload: Some(value.clone()),
            },
            None => Acknowledgement::default(),
        }
    }
}

fn paginate(records: &[ServerRecord], page: u32, limit: u32) -> (Vec<ServerRecord>, u32) {
    let limit = limit.max(1) as usize;
    let total_pages = records.len().div_ceil(limit).max(1) as u32;
    let items = records
        .iter()
        .skip((page.saturating_sub(1) as usize) * limit)
        .take(limit)
        .cloned()
        .collect();
    (items, total_pages)
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn fetch_snapshot_page(
        &self,
        request: &SnapshotRequest,
    ) -> Result<Page<ServerRecord>, ApiError> {
        self.with(|s| {
            if let Some(error) = s.snapshot_failures.get(&request.entity_type) {
                return Err(error.clone());
            }
            let records = s
                .snapshots
                .get(&(request.entity_type, request.scope.clone()))
                .cloned()
                .unwrap_or_default();
            let (items, total_pages) = paginate(&records, request.page, request.limit);
            Ok(Page {
                items,
                page: request.page,
                total_pages: Some(total_pages),
                sync_token: None,
                server_time: None,
            })
        })
    }

    async fn fetch_changes_page(
        &self,
        request: &ChangesRequest,
    ) -> Result<Page<ServerRecord>, ApiError> {
        self.with(|s| {
            s.change_requests.push(request.clone());
            if let Some(error) = s.change_failures.get(&request.entity_type) {
                return Err(error.clone());
            }
            let (records, token) = s
                .changes
                .get(&request.entity_type)
                .cloned()
                .unwrap_or_default();
            let (items, total_pages) = paginate(&records, request.page, request.limit);
            Ok(Page {
                items,
                page: request.page,
                total_pages: Some(total_pages),
                sync_token: token,
                server_time: None,
            })
        })
    }

    async fn push_mutation(
        &self,
        request: &MutationRequest,
    ) -> Result<Acknowledgement, ApiError> {
        let step = self.with(|s| {
            s.pushes.push(request.clone());
            s.push_script.pop_front()
        });

        match step {
            Some(PushStep::Fail(error)) => Err(error),
            Some(PushStep::ApplyThenFail(error)) => {
                self.with(|s| Self::apply(s, request));
                Err(error)
            }
            Some(PushStep::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.with(|s| Self::apply(s, request)))
            }
            None => Ok(self.with(|s| Self::apply(s, request))),
        }
    }

    async fn health(&self) -> Result<(), ApiError> {
        if self.with(|s| s.healthy) {
            Ok(())
        } else {
            Err(ApiError::Network("connection refused".to_string()))
        }
    }
}

/// In-memory store with an active teacher session
pub(crate) fn teacher_store(user_id: &str) -> SharedStore {
    let mut store = LocalStore::open_in_memory().unwrap();
    store
        .begin_session(&Session::new(user_id, Role::Teacher, "school-1"), false)
        .unwrap();
    shared(store)
}

pub(crate) fn timeout() -> ApiError {
    ApiError::Timeout(Duration::from_secs(15))
}

pub(crate) fn rejected(message: &str) -> ApiError {
    ApiError::Rejected {
        status: 422,
        message: message.to_string(),
    }
}
