//! # Domain Types
//!
//! The event log's data model.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Data Model                                      │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────────┐   ┌─────────────────┐  │
//! │  │      Event      │   │       Document       │   │    Revision     │  │
//! │  │  ─────────────  │   │  ──────────────────  │   │  ─────────────  │  │
//! │  │  id             │──►│  _id  (= event.id)   │◄──│  generation     │  │
//! │  │  seq            │   │  _rev                │   │  tag            │  │
//! │  │  type           │   │  _deleted            │   │  "3-9f2c..."    │  │
//! │  │  at (epoch ms)  │   │  aggregateId         │   └─────────────────┘  │
//! │  │  payload        │   │  ...event fields     │                        │
//! │  │  aggregate?     │   └──────────────────────┘                        │
//! │  │  version?       │                                                    │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are what domain code sees. Documents are what adapters store and
//! what replication exchanges. The conversion strips `_id`, `_rev`,
//! `_deleted` and `aggregateId` on the way out.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use ts_rs::TS;

use crate::error::CoreError;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Aggregate Reference
// =============================================================================

/// Identity of the domain entity an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AggregateRef {
    /// Entity id (e.g. a sale id or a transfer id).
    pub id: String,

    /// Entity kind (e.g. "sale", "transfer").
    #[serde(rename = "type")]
    pub aggregate_type: String,
}

impl AggregateRef {
    pub fn new(id: impl Into<String>, aggregate_type: impl Into<String>) -> Self {
        AggregateRef {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// An immutable business fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Event {
    /// Globally unique id of the logical event.
    pub id: String,

    /// Per-store sequence number, assigned at write time.
    #[serde(default)]
    #[ts(type = "number")]
    pub seq: u64,

    /// Event type, e.g. "sale.recorded".
    #[serde(rename = "type")]
    pub event_type: String,

    /// Logical timestamp (epoch ms). Immutable once written.
    #[ts(type = "number")]
    pub at: i64,

    /// Arbitrary structured payload.
    #[ts(type = "unknown")]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub aggregate: Option<AggregateRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional, type = "number")]
    pub version: Option<i64>,
}

impl Event {
    /// Returns the aggregate id, if the event carries aggregate context.
    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate.as_ref().map(|a| a.id.as_str())
    }

    /// Compares everything except the write-time `seq`.
    pub fn same_fact(&self, other: &Event) -> bool {
        self.id == other.id
            && self.event_type == other.event_type
            && self.at == other.at
            && self.payload == other.payload
            && self.aggregate == other.aggregate
            && self.version == other.version
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Parsed `_rev` token: `<generation>-<tag>`.
///
/// `generation` counts successful writes to the same `_id`, so a writer
/// holding an older revision can always detect that it is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    generation: u64,
    tag: String,
}

impl Revision {
    /// Creates a revision. Generation 0 is not a valid write count.
    pub fn new(generation: u64, tag: impl Into<String>) -> Self {
        Revision {
            generation: generation.max(1),
            tag: tag.into(),
        }
    }

    /// First revision of a freshly created document.
    pub fn first(tag: impl Into<String>) -> Self {
        Revision::new(1, tag)
    }

    /// Revision written on top of this one.
    pub fn next(&self, tag: impl Into<String>) -> Self {
        Revision::new(self.generation + 1, tag)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Random tag for engines without their own counter.
    pub fn random_tag() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.tag.cmp(&other.tag))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.tag)
    }
}

impl FromStr for Revision {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, tag) = s
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidRevision(s.to_string()))?;

        let generation: u64 = generation
            .parse()
            .map_err(|_| CoreError::InvalidRevision(s.to_string()))?;

        if generation == 0 || tag.is_empty() {
            return Err(CoreError::InvalidRevision(s.to_string()));
        }

        Ok(Revision {
            generation,
            tag: tag.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Stored Document
// =============================================================================

fn is_false(value: &bool) -> bool {
    !*value
}

/// An event plus storage metadata, as persisted and replicated.
///
/// ## Wire Shape
/// ```json
/// {
///   "_id": "k1", "_rev": "1-3f9a...", "aggregateId": "sale-7",
///   "id": "k1", "seq": 12, "type": "sale.recorded", "at": 1718000000000,
///   "payload": { "total": 24.18 }, "aggregate": { "id": "sale-7", "type": "sale" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Storage identity. Always equal to `event.id`.
    #[serde(rename = "_id")]
    pub id: String,

    /// Revision assigned by the adapter; `None` before the first write.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,

    /// Tombstone marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    /// Denormalized `aggregate.id`, used for indexing.
    #[serde(rename = "aggregateId", default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,

    #[serde(flatten)]
    pub event: Event,
}

impl Document {
    /// Wraps a fresh event for its first write.
    pub fn from_event(event: Event) -> Self {
        Document {
            id: event.id.clone(),
            rev: None,
            deleted: false,
            aggregate_id: event.aggregate_id().map(str::to_string),
            event,
        }
    }

    /// Strips storage metadata.
    pub fn into_event(self) -> Event {
        self.event
    }

    /// Sets the revision (builder style).
    pub fn with_rev(mut self, rev: Revision) -> Self {
        self.rev = Some(rev);
        self
    }
}

// =============================================================================
// Append Contract
// =============================================================================

/// Options accepted by `append`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppendOptions {
    /// Explicit idempotency key; becomes the event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateRef>,

    /// Request parameters the idempotency key is derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_aggregate(mut self, aggregate: AggregateRef) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// Result of `append`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AppendOutcome {
    pub id: String,

    /// `true` only when this call stored the event.
    pub is_new: bool,

    /// The stored event (the original one on replay or conflict).
    pub event: Event,
}

// =============================================================================
// Storage Health
// =============================================================================

/// Snapshot of an adapter's physical storage health. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct StorageMetrics {
    /// Bytes on disk (or in memory) used by the store.
    #[ts(type = "number")]
    pub total_size: u64,

    /// Live documents.
    #[ts(type = "number")]
    pub document_count: u64,

    /// Tombstones plus superseded revisions still held.
    #[ts(type = "number")]
    pub deleted_count: u64,

    /// Local update sequence (advances on every write).
    #[ts(type = "number")]
    pub update_seq: u64,

    pub compact_running: bool,

    /// `deleted_count / (document_count + deleted_count)`.
    pub fragmentation_ratio: f64,
}

impl StorageMetrics {
    pub fn new(
        total_size: u64,
        document_count: u64,
        deleted_count: u64,
        update_seq: u64,
        compact_running: bool,
    ) -> Self {
        let total = document_count + deleted_count;
        let fragmentation_ratio = if total == 0 {
            0.0
        } else {
            deleted_count as f64 / total as f64
        };

        StorageMetrics {
            total_size,
            document_count,
            deleted_count,
            update_seq,
            compact_running,
            fragmentation_ratio,
        }
    }
}

/// Rough storage usage report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub bytes: u64,
    pub items: u64,
}

// =============================================================================
// Unit Tests
// =============================================================================
