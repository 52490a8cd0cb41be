//! # tally-core: Pure Types for the Tally Event Log
//!
//! This crate holds the data model that every other Tally crate speaks.
//! It contains no I/O: storage lives in `tally-db`, networking in `tally-sync`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │        Domain collaborators (sales, stock moves, shifts)        │   │
//! │  │              append(type, payload, options) / query             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌────────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │idempotency │  │   retry   │  │ settings  │  │   │
//! │  │   │  Event    │  │ identity   │  │  policy   │  │ defaults  │  │   │
//! │  │   │ Document  │  │ resolution │  │ schedules │  │           │  │   │
//! │  │   └───────────┘  └────────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          tally-db (adapters, event store, compaction)           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Event, Document, Revision, metrics
//! - [`idempotency`] - Event identity resolution (key, derived hash, random)
//! - [`retry`] - Bounded retry policy shared by replication and compaction
//! - [`settings`] - Configuration structs with serde defaults
//! - [`validation`] - Input checks for event types, keys and store names
//! - [`error`] - Core error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::{idempotency::resolve_identity, AppendOptions};
//!
//! let options = AppendOptions::new().with_key("k1");
//! let identity = resolve_identity("sale.recorded", &options).unwrap();
//! assert_eq!(identity.id(), "k1");
//!
//! let derived = AppendOptions::new().with_params(json!({ "receipt": 42 }));
//! let a = resolve_identity("sale.recorded", &derived).unwrap();
//! let b = resolve_identity("sale.recorded", &derived).unwrap();
//! assert_eq!(a.id(), b.id());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod idempotency;
pub mod retry;
pub mod settings;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use idempotency::EventIdentity;
pub use retry::{RetryPolicy, RetrySchedule};
pub use settings::{
    CompactionSettings, OutboxSettings, ReplicationSettings, StorageEngine, StoreSettings,
};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Key suffix reserved by the key/value engine for its revision counter.
///
/// Event ids may never equal this value, otherwise the document entry
/// `<store>_<id>` would collide with `<store>_rev_counter`.
pub const REV_COUNTER_KEY: &str = "rev_counter";

/// Prefix for ids derived from request parameters.
pub const DERIVED_ID_PREFIX: &str = "h-";
