//! # Error Types
//!
//! Error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Malformed revisions, serialization             │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  tally-db errors                                                       │
//! │  └── StoreError       - Adapter and event store failures               │
//! │                                                                         │
//! │  tally-sync errors                                                     │
//! │  └── SyncError        - Config, network, replication failures          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → StoreError → SyncError            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Expected operational states (conflicts, offline, paused) are never errors.
//! They are modeled as values by the crates above this one.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core data-model errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A `_rev` token could not be parsed.
    ///
    /// ## When This Occurs
    /// - Replicated document with a foreign revision format
    /// - Hand-edited key/value entry
    #[error("Invalid revision '{0}': expected <generation>-<tag>")]
    InvalidRevision(String),

    /// JSON (de)serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value collides with a name the storage layout reserves.
    #[error("{field} '{value}' is reserved")]
    Reserved { field: String, value: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
