//! # Persistence Adapters
//!
//! One async contract over documents, two engines behind it.
//!
//! ## Adapter Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Persistence Adapter                                │
//! │                                                                         │
//! │   EventStore / ReplicationManager / CompactionManager                  │
//! │                        │                                                │
//! │                        ▼  Arc<dyn PersistenceAdapter>                   │
//! │   ┌──────────────────────────────────────────────────────────────┐     │
//! │   │ get · put · bulk_put · remove · list_all · find_by           │     │
//! │   │ changes_since · get_meta/put_meta · usage · metrics          │     │
//! │   │ compact · compaction_state · destroy                         │     │
//! │   └───────────────┬──────────────────────────────┬───────────────┘     │
//! │                   │                              │                      │
//! │   ┌───────────────▼──────────────┐  ┌────────────▼─────────────────┐   │
//! │   │      SqliteAdapter           │  │        KvAdapter             │   │
//! │   │  indexed columns, revisions  │  │  <store>_<id> entries        │   │
//! │   │  table, VACUUM compaction    │  │  <store>_rev_counter         │   │
//! │   │  native find_by              │  │  scan + sort, no find_by     │   │
//! │   └──────────────────────────────┘  └──────────────────────────────┘   │
//! │                                                                         │
//! │   open_adapter(settings): sqlite | key_value | auto (sqlite → kv)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Rules
//! ```text
//! put(doc)             no _rev + missing id     → Created   (generation 1)
//!                      _rev == stored _rev      → Updated   (generation + 1)
//!                      anything else            → RevisionConflict
//!
//! bulk_put(docs)       _rev newer than stored   → Updated   (rev kept as given)
//!                      _rev equal or older      → Unchanged
//!                      missing id, _rev given   → Created   (rev kept as given)
//!                      no _rev                  → put rules
//! ```

pub mod kv;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use tally_core::validation::validate_store_name;
use tally_core::{Document, Revision, StorageEngine, StorageMetrics, StorageUsage, StoreSettings};

use crate::error::{StoreError, StoreResult};

pub use kv::{FileKv, KvAdapter, KvBackend, MemoryKv};
pub use sqlite::{SqliteAdapter, SqliteConfig};

// =============================================================================
// Contract Types
// =============================================================================

/// What a write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Updated,
    /// A replicated revision that was not newer than the stored one.
    Unchanged,
}

/// Result of `put`, `bulk_put` and `remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteResult {
    pub id: String,
    /// Revision now stored for `id`.
    pub rev: Revision,
    pub outcome: WriteOutcome,
}

/// One entry of the local changes feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    /// Adapter update sequence at the time of the write.
    pub seq: u64,
    pub doc: Document,
}

/// Secondary fields with native indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
    AggregateId,
    EventType,
}

impl std::fmt::Display for IndexField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexField::AggregateId => write!(f, "aggregate_id"),
            IndexField::EventType => write!(f, "event_type"),
        }
    }
}

/// Progress of the engine's compaction primitive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompactionState {
    #[default]
    Idle,
    Running,
    Finished,
    Failed(String),
}

impl CompactionState {
    pub fn is_running(&self) -> bool {
        matches!(self, CompactionState::Running)
    }
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// Local document storage for one named store.
///
/// Implementations are shared as `Arc<dyn PersistenceAdapter>` between the
/// event store, replication and compaction.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Store name, e.g. `tally_events`.
    fn name(&self) -> &str;

    /// Concrete engine (never `Auto`).
    fn engine(&self) -> StorageEngine;

    /// Fetches a document, tombstones included.
    async fn get(&self, id: &str) -> StoreResult<Option<Document>>;

    /// Writes one document with merge semantics.
    async fn put(&self, doc: Document) -> StoreResult<WriteResult>;

    /// Writes documents keeping their revisions (replication semantics).
    async fn bulk_put(&self, docs: Vec<Document>) -> StoreResult<Vec<WriteResult>>;

    /// Writes a tombstone on top of `rev`.
    async fn remove(&self, id: &str, rev: &Revision) -> StoreResult<WriteResult>;

    /// Live documents ordered by event `seq`, then id.
    async fn list_all(&self) -> StoreResult<Vec<Document>>;

    /// Live documents whose `field` equals `value`, ordered by `at`, then `seq`.
    async fn find_by(&self, field: IndexField, value: &str) -> StoreResult<Vec<Document>>;

    /// Writes after update sequence `since`, oldest first, tombstones included.
    async fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Change>>;

    /// Reads a non-replicated local metadata entry.
    async fn get_meta(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Writes a non-replicated local metadata entry.
    async fn put_meta(&self, key: &str, value: Value) -> StoreResult<()>;

    async fn usage(&self) -> StoreResult<StorageUsage>;

    async fn metrics(&self) -> StoreResult<StorageMetrics>;

    /// Starts compaction. Poll `compaction_state` for completion.
    async fn compact(&self) -> StoreResult<()>;

    async fn compaction_state(&self) -> CompactionState;

    /// Irreversibly drops every document and metadata entry of this store.
    async fn destroy(&self) -> StoreResult<()>;
}

// =============================================================================
// Shared Write Planning
// =============================================================================

/// What an engine should do for one incoming document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WritePlan {
    Create(Revision),
    Replace(Revision),
    Keep(Revision),
}

impl WritePlan {
    pub(crate) fn into_result(self, id: &str) -> WriteResult {
        let (rev, outcome) = match self {
            WritePlan::Create(rev) => (rev, WriteOutcome::Created),
            WritePlan::Replace(rev) => (rev, WriteOutcome::Updated),
            WritePlan::Keep(rev) => (rev, WriteOutcome::Unchanged),
        };
        WriteResult {
            id: id.to_string(),
            rev,
            outcome,
        }
    }
}

/// `put` rules.
pub(crate) fn plan_put(
    id: &str,
    incoming: Option<&Revision>,
    current: Option<&Revision>,
    tag: String,
) -> StoreResult<WritePlan> {
    match (incoming, current) {
        (None, None) => Ok(WritePlan::Create(Revision::first(tag))),
        (Some(given), Some(stored)) if given == stored => Ok(WritePlan::Replace(stored.next(tag))),
        (given, stored) => Err(StoreError::conflict(id, given, stored)),
    }
}

/// `bulk_put` rules.
pub(crate) fn plan_replicated(
    id: &str,
    incoming: Option<&Revision>,
    current: Option<&Revision>,
    tag: String,
) -> StoreResult<WritePlan> {
    match (incoming, current) {
        (Some(given), None) => Ok(WritePlan::Create(given.clone())),
        (Some(given), Some(stored)) if given > stored => Ok(WritePlan::Replace(given.clone())),
        (Some(_), Some(stored)) => Ok(WritePlan::Keep(stored.clone())),
        (None, stored) => plan_put(id, None, stored, tag),
    }
}

/// Rejects documents whose storage id and event id disagree.
pub(crate) fn check_identity(doc: &Document) -> StoreResult<()> {
    if doc.id != doc.event.id {
        return Err(StoreError::InvalidDocument {
            id: doc.id.clone(),
            reason: format!("_id does not match event id '{}'", doc.event.id),
        });
    }
    if doc.id.is_empty() {
        return Err(StoreError::InvalidDocument {
            id: doc.id.clone(),
            reason: "empty id".to_string(),
        });
    }
    Ok(())
}

/// Denormalized aggregate id for indexing.
pub(crate) fn index_aggregate_id(doc: &Document) -> Option<String> {
    doc.event
        .aggregate_id()
        .map(str::to_string)
        .or_else(|| doc.aggregate_id.clone())
}

// =============================================================================
// Factory
// =============================================================================

/// Opens the adapter selected by `settings.engine`.
///
/// ## Selection
/// ```text
/// sqlite     → SqliteAdapter or error
/// key_value  → KvAdapter (FileKv under data_dir, MemoryKv without one)
/// auto       → SqliteAdapter; on Unavailable warn and open KvAdapter
/// ```
pub async fn open_adapter(settings: &StoreSettings) -> StoreResult<Arc<dyn PersistenceAdapter>> {
    let name = settings.store_name();
    validate_store_name(&name)?;

    let adapter: Arc<dyn PersistenceAdapter> = match settings.engine {
        StorageEngine::Sqlite => Arc::new(open_sqlite(&name, settings).await?),
        StorageEngine::KeyValue => Arc::new(open_kv(&name, settings).await?),
        StorageEngine::Auto => match open_sqlite(&name, settings).await {
            Ok(adapter) => Arc::new(adapter),
            Err(StoreError::Unavailable(reason)) => {
                warn!(
                    store = %name,
                    reason = %reason,
                    "SQLite unavailable, falling back to key/value engine"
                );
                Arc::new(open_kv(&name, settings).await?)
            }
            Err(e) => return Err(e),
        },
    };

    info!(store = %name, engine = %adapter.engine(), "Persistence adapter ready");
    Ok(adapter)
}

async fn open_sqlite(name: &str, settings: &StoreSettings) -> StoreResult<SqliteAdapter> {
    let config = match &settings.data_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            SqliteConfig::new(dir.join(format!("{}.db", name)))
        }
        None => SqliteConfig::in_memory(),
    };
    SqliteAdapter::open(name, config).await
}

async fn open_kv(name: &str, settings: &StoreSettings) -> StoreResult<KvAdapter> {
    let backend: Arc<dyn KvBackend> = match &settings.data_dir {
        Some(dir) => Arc::new(FileKv::open(dir.join(format!("{}_kv", name))).await?),
        None => Arc::new(MemoryKv::new()),
    };
    KvAdapter::open(name, backend).await
}
