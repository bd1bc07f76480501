//! Storage error handling
//!
//! Provides typed errors for local store operations with descriptive
//! messages and recovery suggestions. A storage failure risks losing
//! queued offline work, so these are always propagated to the caller.

use std::io;
use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::models::UnknownVariant;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing the database
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied { path: PathBuf, details: String },

    /// Disk is full or quota exceeded
    #[error("Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again.")]
    DiskFull { path: PathBuf },

    /// Database file is damaged or not a database
    #[error("Database at '{path}' is corrupted: {details}")]
    CorruptDatabase { path: PathBuf, details: String },

    /// Failed to open the database
    #[error("Failed to open database '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload could not be encoded or decoded
    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value this build doesn't understand
    #[error("Invalid stored row: {0}")]
    InvalidRow(String),

    /// Another thread panicked while holding the store lock
    #[error("Local store lock poisoned")]
    LockPoisoned,

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Classify a SQLite error raised while working on the database at `path`
    pub fn from_sqlite(error: rusqlite::Error, path: PathBuf) -> Self {
        let code = match &error {
            rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
            _ => None,
        };

        match code {
            Some(ErrorCode::DiskFull) => StorageError::DiskFull { path },
            Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) => {
                StorageError::PermissionDenied {
                    path,
                    details: error.to_string(),
                }
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StorageError::CorruptDatabase {
                    path,
                    details: error.to_string(),
                }
            }
            Some(ErrorCode::CannotOpen) => StorageError::Open {
                path,
                source: error,
            },
            _ => StorageError::Database(error),
        }
    }

    /// Create an error from an I/O error while preparing `path`
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                details: error.to_string(),
            },
            _ if is_disk_full_error(&error) => StorageError::DiskFull { path },
            _ => StorageError::CreateDirectory {
                path,
                source: error,
            },
        }
    }

    /// Check if the user can do something about this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::CorruptDatabase { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions on the data directory.")
            }
            StorageError::CorruptDatabase { .. } => Some(
                "Move the database aside and sign in again. Unsynced local changes in the damaged file cannot be uploaded.",
            ),
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            _ => None,
        }
    }
}

impl From<UnknownVariant> for StorageError {
    fn from(e: UnknownVariant) -> Self {
        StorageError::InvalidRow(e.to_string())
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
