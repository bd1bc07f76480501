//! Error types for Classync.
//!
//! Errors are categorized by the operation that failed:
//!
//! - [`Error::Conflict`] - device data belongs to a different user
//! - [`Error::Hydration`] - snapshot pull failed and was rolled back
//! - [`Error::MutationRejected`] - server refused a mutation (terminal)
//! - [`Error::Network`] / [`Error::Timeout`] - retryable transport failures
//! - [`Error::Storage`] - local persistence failure, always surfaced
//! - [`Error::NoSession`] - operation needs a signed-in user

use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;
use crate::models::{EntityType, MutationId};
use crate::storage::StorageError;

/// Result type alias for Classync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Classync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Cached data on this device belongs to another user
    #[error("This device holds data belonging to {existing_owner}; clear it before continuing")]
    Conflict { existing_owner: String },

    /// A snapshot fetch failed; the previous cache is untouched
    #[error("Hydration failed while fetching {entity_type}: {source}")]
    Hydration {
        entity_type: EntityType,
        #[source]
        source: ApiError,
    },

    /// The server refused a mutation; it needs manual action
    #[error("Server rejected mutation {mutation_id} (HTTP {status}): {message}")]
    MutationRejected {
        mutation_id: MutationId,
        status: u16,
        message: String,
    },

    /// Connection failure or server-side error, safe to retry
    #[error("Network error: {0}")]
    Network(String),

    /// A request didn't finish within its deadline
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Local persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No user is signed in on this device
    #[error("No active session. Sign in first.")]
    NoSession,
}

impl Error {
    /// Map a transport error raised while uploading `mutation_id`
    pub fn from_upload(error: ApiError, mutation_id: MutationId) -> Self {
        match error {
            ApiError::Rejected { status, message } => Error::MutationRejected {
                mutation_id,
                status,
                message,
            },
            ApiError::Timeout(after) => Error::Timeout(after),
            other => Error::Network(other.to_string()),
        }
    }

    /// Whether the scheduler may try the same operation again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}
