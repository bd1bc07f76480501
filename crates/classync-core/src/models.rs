//! Data models for Classync
//!
//! Defines the session, cached entities, mutation log entries and sync
//! cursors held by the local store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Client-generated idempotency key of a mutation
pub type MutationId = Uuid;

/// Returned when a stored or user-supplied name doesn't match any variant
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Role of the signed-in user; decides the hydration scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Principal,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Principal => "principal",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teacher" => Ok(Role::Teacher),
            "principal" => Ok(Role::Principal),
            _ => Err(UnknownVariant::new("role", s)),
        }
    }
}

/// The authenticated user that owns the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub school_id: String,
    pub authenticated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session authenticated now
    pub fn new(user_id: impl Into<String>, role: Role, school_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            school_id: school_id.into(),
            authenticated_at: Utc::now(),
        }
    }
}

/// Institution-scoped entity kinds held in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Classes,
    Students,
    Teachers,
    Subjects,
    Attendance,
    Marks,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Classes,
        EntityType::Students,
        EntityType::Teachers,
        EntityType::Subjects,
        EntityType::Attendance,
        EntityType::Marks,
    ];

    /// Name used in table rows and URL paths
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Classes => "classes",
            EntityType::Students => "students",
            EntityType::Teachers => "teachers",
            EntityType::Subjects => "subjects",
            EntityType::Attendance => "attendance",
            EntityType::Marks => "marks",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("entity type", s))
    }
}

/// Kind of local write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationOp {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(MutationOp::Create),
            "update" => Ok(MutationOp::Update),
            "delete" => Ok(MutationOp::Delete),
            _ => Err(UnknownVariant::new("operation", s)),
        }
    }
}

/// Reconciliation state of a cached entity
///
/// `Pending` means the visible payload carries a local write the server
/// hasn't acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SyncState {
    Clean,
    Pending(MutationOp),
    Failed(String),
}

impl SyncState {
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncState::Pending(_))
    }

    /// Column representation: (state, error)
    pub(crate) fn to_columns(&self) -> (&'static str, Option<&str>) {
        match self {
            SyncState::Clean => ("clean", None),
            SyncState::Pending(MutationOp::Create) => ("pending_create", None),
            SyncState::Pending(MutationOp::Update) => ("pending_update", None),
            SyncState::Pending(MutationOp::Delete) => ("pending_delete", None),
            SyncState::Failed(reason) => ("failed", Some(reason.as_str())),
        }
    }

    pub(crate) fn from_columns(state: &str, error: Option<String>) -> Result<Self, UnknownVariant> {
        match state {
            "clean" => Ok(SyncState::Clean),
            "pending_create" => Ok(SyncState::Pending(MutationOp::Create)),
            "pending_update" => Ok(SyncState::Pending(MutationOp::Update)),
            "pending_delete" => Ok(SyncState::Pending(MutationOp::Delete)),
            "failed" => Ok(SyncState::Failed(error.unwrap_or_default())),
            other => Err(UnknownVariant::new("sync state", other)),
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Clean => f.write_str("clean"),
            SyncState::Pending(op) => write!(f, "pending {}", op),
            SyncState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A row of the local cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// What reads show, including optimistic local writes
    pub payload: Value,
    /// Last payload acknowledged by the server (None if never acknowledged)
    pub server_payload: Option<Value>,
    pub version: i64,
    pub owner_user_id: String,
    pub sync_state: SyncState,
}

/// Upload state of a mutation log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Failed => "failed",
        }
    }
}

impl FromStr for MutationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "failed" => Ok(MutationStatus::Failed),
            _ => Err(UnknownVariant::new("mutation status", s)),
        }
    }
}

/// A local write waiting for server acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationLogEntry {
    /// Local insertion order; breaks ties between equal `created_at`
    pub seq: i64,
    pub mutation_id: MutationId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub owner_user_id: String,
    pub operation: MutationOp,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Backoff gate; the entry isn't sent before this instant
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub status: MutationStatus,
}

impl MutationLogEntry {
    /// Whether the scheduler may send this entry at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MutationStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Watermark for incremental pulls of one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity_type: EntityType,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_token: Option<String>,
}

/// A server-side row as delivered by snapshot and change endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    #[serde(alias = "id")]
    pub entity_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub version: i64,
    /// Tombstone delivered by change feeds
    #[serde(default)]
    pub deleted: bool,
}

impl ServerRecord {
    pub fn new(entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload,
            version: 1,
            deleted: false,
        }
    }

    pub fn tombstone(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            payload: Value::Null,
            version: 0,
            deleted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_entity_type_roundtrip_names() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert_eq!("Marks".parse::<EntityType>().unwrap(), EntityType::Marks);
        assert!("grades".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert_eq!("PRINCIPAL".parse::<Role>().unwrap(), Role::Principal);
        let err = "janitor".parse::<Role>().unwrap_err();
        assert!(err.to_string().contains("janitor"));
    }

    #[test]
    fn test_sync_state_columns() {
        let states = [
            SyncState::Clean,
            SyncState::Pending(MutationOp::Create),
            SyncState::Pending(MutationOp::Update),
            SyncState::Pending(MutationOp::Delete),
            SyncState::Failed("422 marks out of range".to_string()),
        ];
        for state in states {
            let (name, error) = state.to_columns();
            let parsed = SyncState::from_columns(name, error.map(String::from)).unwrap();
            assert_eq!(parsed, state);
        }
        assert!(SyncState::from_columns("dirty", None).is_err());
    }

    #[test]
    fn test_entry_is_due() {
        let now = Utc::now();
        let mut entry = MutationLogEntry {
            seq: 1,
            mutation_id: Uuid::new_v4(),
            entity_type: EntityType::Attendance,
            entity_id: "S1-C1-2024-05-01".to_string(),
            owner_user_id: "teacher-7".to_string(),
            operation: MutationOp::Create,
            payload: json!({"status": "present"}),
            created_at: now,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            status: MutationStatus::Pending,
        };
        assert!(entry.is_due(now));

        entry.next_attempt_at = Some(now + Duration::seconds(5));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + Duration::seconds(5)));

        entry.status = MutationStatus::Failed;
        assert!(!entry.is_due(now + Duration::seconds(60)));
    }

    #[test]
    fn test_server_record_accepts_id_alias() {
        let record: ServerRecord =
            serde_json::from_value(json!({"id": "C1", "payload": {"name": "7B"}, "version": 3}))
                .unwrap();
        assert_eq!(record.entity_id, "C1");
        assert_eq!(record.version, 3);
        assert!(!record.deleted);
    }
}
