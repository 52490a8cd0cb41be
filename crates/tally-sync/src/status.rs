//! # Replication Status
//!
//! The externally visible replication state and the observer trait.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Replication States                                 │
//! │                                                                         │
//! │   configure() ok        start_replication()                             │
//! │  ┌──────┐ ───────────► ┌──────┐ ───────────► ┌────────┐ ◄──► ┌────────┐ │
//! │  │(init)│              │ idle │              │ active │      │ paused │ │
//! │  └──┬───┘ ◄─────────── └──┬───┘ ◄─────────── └───┬────┘      └───┬────┘ │
//! │     │   stop_replication  │ ▲                     │    ┌───────┐   │      │
//! │     │                     │ │ online              └──► │ error │ ◄─┘      │
//! │     │ connector fails     │ │ (+3 s: restart)          └───┬───┘          │
//! │     ▼                     │ │                              │              │
//! │  ┌─────────────┐          ▼ │      network offline         │              │
//! │  │ unavailable │        ┌───┴─────┐ ◄──────────────────────┘              │
//! │  └─────────────┘        │ offline │  (from any replicating state)         │
//! │                         └─────────┘                                     │
//! │                                                                         │
//! │  Folding: any direction active → active; else any error → error;       │
//! │           else paused. Denied documents never change the state.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

// =============================================================================
// States
// =============================================================================

/// Externally visible replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Configured (or not yet), not replicating.
    #[default]
    Idle,
    /// At least one direction is transferring documents.
    Active,
    /// Both directions caught up and waiting for changes.
    Paused,
    /// A direction failed and is backing off.
    Error,
    /// Network reported down.
    Offline,
    /// The remote could not be constructed at all.
    Unavailable,
}

impl SyncState {
    /// True while push/pull loops are expected to be running.
    pub fn is_replicating(&self) -> bool {
        matches!(self, SyncState::Active | SyncState::Paused | SyncState::Error)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Active => "active",
            SyncState::Paused => "paused",
            SyncState::Error => "error",
            SyncState::Offline => "offline",
            SyncState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Push,
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("push"),
            Direction::Pull => f.write_str("pull"),
        }
    }
}

/// Per-direction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionState {
    #[default]
    Stopped,
    Active,
    Paused,
    Error,
}

/// Events reported by a running direction.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectionEvent {
    /// A batch of `docs` documents was transferred.
    Change { docs: usize },
    /// Caught up; waiting for new changes.
    Paused,
    /// Resumed transferring.
    Active,
    /// The remote refused to store one document.
    Denied { id: String, reason: String },
    /// The last attempt failed; backing off.
    Error(String),
}

/// Combines the two direction states into one visible state.
pub fn fold_state(push: DirectionState, pull: DirectionState) -> SyncState {
    let both = [push, pull];
    if both.contains(&DirectionState::Active) {
        SyncState::Active
    } else if both.contains(&DirectionState::Error) {
        SyncState::Error
    } else {
        SyncState::Paused
    }
}

// =============================================================================
// Status Snapshot
// =============================================================================

/// Current replication status for external queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub push: DirectionState,
    pub pull: DirectionState,
    pub last_error: Option<String>,
    pub docs_pushed: u64,
    pub docs_pulled: u64,
    /// Wall-clock time of the last transferred batch.
    pub last_change_at: Option<DateTime<Utc>>,
    /// Remote database URL once configured.
    pub remote_db: Option<String>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Observer for replication changes (e.g. a UI bridge).
///
/// Called while internal state is locked: implementations must not block
/// or call back into the manager.
pub trait SyncEventEmitter: Send + Sync {
    /// The visible state or counters changed.
    fn emit_status(&self, status: &SyncStatus);

    /// The remote refused a document.
    fn emit_denied(&self, direction: Direction, id: &str, reason: &str);

    /// A failure worth surfacing.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_denied(&self, _direction: Direction, _id: &str, _reason: &str) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}
