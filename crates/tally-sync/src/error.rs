//! # Sync Error Types
//!
//! Error types for replication, relay and configuration.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Lifecycle           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  NotConfigured          │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  Offline                │ │
//! │  │  ConfigLoad/Save│  │  RemoteStatus   │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Storage      │  │     Relay       │                              │
//! │  │                 │  │                 │                              │
//! │  │  Store          │  │  RelayFailed    │                              │
//! │  │  Serialization  │  │                 │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tally_db::StoreError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration value.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Remote URL could not be parsed or has the wrong scheme.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// `start_replication` called before a successful `configure`.
    #[error("Replication is not configured")]
    NotConfigured,

    /// Replication refused while the network is down.
    #[error("Network is offline")]
    Offline,

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Remote could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Remote did not answer in time.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// Remote answered with an unexpected status.
    #[error("Remote returned {status}: {reason}")]
    RemoteStatus { status: u16, reason: String },

    /// Remote returned a body we can't read.
    #[error("Invalid remote response: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Relay Errors
    // =========================================================================
    #[error("Relay failed: {0}")]
    RelayFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if let Some(status) = err.status() {
            SyncError::RemoteStatus {
                status: status.as_u16(),
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::ConnectionFailed(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried as-is.
    ///
    /// Server-side 5xx and 429 answers count as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Timeout(_)
            | SyncError::RelayFailed(_) => true,
            SyncError::RemoteStatus { status, .. } => *status >= 500 || *status == 429,
            SyncError::Store(e) => e.is_unavailable(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::NotConfigured
        )
    }
}
