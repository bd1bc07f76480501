//! Storage layer
//!
//! SQLite persistence for the local store. The schema lives in [`schema`],
//! failure classification in [`error`]. Row-level operations are exposed
//! through [`crate::store::LocalStore`].

pub mod error;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
