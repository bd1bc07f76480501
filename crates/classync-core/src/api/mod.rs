//! Backend API boundary
//!
//! The server is the source of truth and is consumed through the
//! [`BackendApi`] trait. [`HttpBackend`] talks to the REST backend; tests
//! plug in scripted fakes.
//!
//! ## Envelope
//!
//! Every endpoint answers with
//! `{success | status, data, pagination?, message?}`. List endpoints are
//! paginated and callers drain them until the last page.

mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use http::HttpBackend;

use crate::models::{EntityType, MutationId, MutationLogEntry, MutationOp, ServerRecord};

/// Transport-level outcome of a failed request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// 4xx / validation failure; retrying the same request won't help
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// 5xx or throttling
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Connection refused, reset, DNS failure...
    #[error("network error: {0}")]
    Network(String),

    /// No response within the request deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Response arrived but couldn't be understood
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            // Request timeout and throttling are transient even though they're 4xx
            408 | 429 => ApiError::Server { status, message },
            400..=499 => ApiError::Rejected { status, message },
            _ => ApiError::Server { status, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApiError::Rejected { .. })
    }
}

/// Which slice of the institution a snapshot request covers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    School(String),
    Teacher(String),
    Class(String),
}

impl Scope {
    /// Query parameter used by the REST backend
    pub fn query_pair(&self) -> (&'static str, &str) {
        match self {
            Scope::School(id) => ("schoolId", id),
            Scope::Teacher(id) => ("teacherId", id),
            Scope::Class(id) => ("classId", id),
        }
    }
}

/// One page of a role-scoped snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    pub entity_type: EntityType,
    pub scope: Scope,
    pub page: u32,
    pub limit: u32,
}

/// One page of changes since a cursor
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesRequest {
    pub entity_type: EntityType,
    pub since: Option<DateTime<Utc>>,
    pub token: Option<String>,
    pub page: u32,
    pub limit: u32,
}

/// A page of records plus what the server said about pagination
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub total_pages: Option<u32>,
    /// Opaque watermark for the next incremental pull
    pub sync_token: Option<String>,
    pub server_time: Option<DateTime<Utc>>,
}

impl<T> Page<T> {
    pub fn single(items: Vec<T>) -> Self {
        Self {
            items,
            page: 1,
            total_pages: Some(1),
            sync_token: None,
            server_time: None,
        }
    }

    /// Whether draining should stop after this page
    ///
    /// Without pagination metadata a short page marks the end.
    pub fn is_last(&self, limit: u32) -> bool {
        match self.total_pages {
            Some(total) => self.page >= total,
            None => self.items.len() < limit as usize,
        }
    }
}

/// Upload body for one mutation log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    /// Idempotency key; replays with the same id must not duplicate effects
    pub mutation_id: MutationId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: MutationOp,
    pub payload: Value,
}

impl From<&MutationLogEntry> for MutationRequest {
    fn from(entry: &MutationLogEntry) -> Self {
        Self {
            mutation_id: entry.mutation_id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            payload: entry.payload.clone(),
        }
    }
}

/// What the server returned for an accepted mutation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    #[serde(default)]
    pub version: Option<i64>,
    /// Canonical server copy of the entity, if the server sent one
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Server operations the sync engine depends on
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_snapshot_page(
        &self,
        request: &SnapshotRequest,
    ) -> Result<Page<ServerRecord>, ApiError>;

    async fn fetch_changes_page(
        &self,
        request: &ChangesRequest,
    ) -> Result<Page<ServerRecord>, ApiError>;

    async fn push_mutation(&self, request: &MutationRequest)
        -> Result<Acknowledgement, ApiError>;

    async fn health(&self) -> Result<(), ApiError>;
}

/// Source of the bearer token; token storage itself lives elsewhere
pub trait CredentialStore: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Credential store holding a fixed token (from config or environment)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl CredentialStore for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Run a backend call under a deadline; expiry counts as a timeout failure
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout(limit)),
    }
}
