//! # tally-db: Local Storage for the Tally Event Log
//!
//! Everything that touches on-device storage: engines, the append-only
//! event store on top of them, and the compaction scheduler.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  append("sale.recorded", payload, options)                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  EventStore   │    │   Adapters    │    │  Compaction  │  │   │
//! │  │   │               │    │               │    │   Manager    │  │   │
//! │  │   │ idempotent    │───►│ SqliteAdapter │◄───│ thresholds   │  │   │
//! │  │   │ append/query  │    │ KvAdapter     │    │ cooldown     │  │   │
//! │  │   │ conflict log  │    │ (factory)     │    │ retries      │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │             tally_events.db  or  tally_events_kv/               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`adapter`] - Persistence adapter trait, engines and factory
//! - [`event_store`] - Idempotent append, replay, queries, replicated merge
//! - [`compaction`] - Periodic storage maintenance
//! - [`migrations`] - Embedded SQLite schema
//! - [`error`] - Storage error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_core::{AppendOptions, StoreSettings};
//! use tally_db::{open_adapter, EventStore};
//!
//! let adapter = open_adapter(&StoreSettings::default()).await?;
//! let store = EventStore::open(adapter).await?;
//!
//! let outcome = store
//!     .append("sale.recorded", json!({ "total": 1250 }), AppendOptions::new().with_key("k1"))
//!     .await?;
//! assert!(outcome.is_new);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod adapter;
pub mod compaction;
pub mod error;
pub mod event_store;
pub mod migrations;

// =============================================================================
// Re-exports
// =============================================================================

pub use adapter::{
    open_adapter, Change, CompactionState, IndexField, KvAdapter, PersistenceAdapter,
    SqliteAdapter, SqliteConfig, WriteOutcome, WriteResult,
};
pub use compaction::{CompactionManager, CompactionResult, SkipReason, TickOutcome};
pub use error::{StoreError, StoreResult};
pub use event_store::{ConflictRecord, ConflictSource, EventSink, EventStore, MergeReport};
