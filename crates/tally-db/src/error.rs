//! # Storage Error Types
//!
//! Error types for adapters and the event store.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error / std::io::Error / serde_json::Error                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (tally-sync) ← Replication / outbox context                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Idempotency conflicts are NOT errors here: `append` and
//! `merge_replicated` report them as data. `RevisionConflict` is the
//! adapter-level signal that a writer held a stale `_rev`.

use tally_core::{CoreError, ValidationError};
use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage engine could not be opened.
    ///
    /// ## When This Occurs
    /// - Database file can't be created (permissions, path is a directory)
    /// - Key/value directory can't be created
    /// - Connection pool closed
    ///
    /// Fatal for the adapter instance. The factory may pick another engine.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Document not found.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// The writer's `_rev` does not match the stored revision.
    #[error("Revision conflict on '{id}': expected {expected}, found {actual}")]
    RevisionConflict {
        id: String,
        expected: String,
        actual: String,
    },

    /// A document could not be stored as given.
    #[error("Invalid document '{id}': {reason}")]
    InvalidDocument { id: String, reason: String },

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored body could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// The engine does not support this operation natively.
    ///
    /// ## When This Occurs
    /// - `find_by` on the key/value engine (callers fall back to scanning)
    #[error("Unsupported by {engine}: {operation}")]
    Unsupported { engine: String, operation: String },

    /// Core data-model error (validation, revision parsing).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal error.
    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Creates a RevisionConflict error.
    pub fn conflict(
        id: impl Into<String>,
        expected: Option<impl ToString>,
        actual: Option<impl ToString>,
    ) -> Self {
        StoreError::RevisionConflict {
            id: id.into(),
            expected: expected.map_or_else(|| "none".to_string(), |r| r.to_string()),
            actual: actual.map_or_else(|| "none".to_string(), |r| r.to_string()),
        }
    }

    /// Creates an Unsupported error.
    pub fn unsupported(engine: impl Into<String>, operation: impl Into<String>) -> Self {
        StoreError::Unsupported {
            engine: engine.into(),
            operation: operation.into(),
        }
    }

    /// Returns true for stale-revision write failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::RevisionConflict { .. })
    }

    /// Returns true if the engine itself is gone.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Convert sqlx errors to StoreError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound     → StoreError::NotFound
/// sqlx::Error::Database        → StoreError::QueryFailed
/// sqlx::Error::Io              → StoreError::Io
/// sqlx::Error::PoolClosed      → StoreError::Unavailable
/// sqlx::Error::PoolTimedOut    → StoreError::Unavailable
/// Other                        → StoreError::Internal
/// ```
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db_err) => StoreError::QueryFailed(db_err.message().to_string()),
            sqlx::Error::Io(io_err) => StoreError::Io(io_err.to_string()),
            sqlx::Error::PoolClosed => StoreError::Unavailable("pool is closed".to_string()),
            sqlx::Error::PoolTimedOut => {
                StoreError::Unavailable("timed out acquiring a connection".to_string())
            }
            _ => StoreError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<ValidationError> for StoreError {
    fn from(err: ValidationError) -> Self {
        StoreError::Core(CoreError::Validation(err))
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
