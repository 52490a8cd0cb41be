//! # Event Store
//!
//! The append-only log on top of a persistence adapter.
//!
//! ## Append Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          append(type, payload, options)                 │
//! │                                                                         │
//! │  resolve_identity ──► id (key | h-<blake3> | uuid)                      │
//! │       │                                                                 │
//! │       ▼   ── write lock held from here ──                               │
//! │  adapter.get(id)                                                        │
//! │       │                                                                 │
//! │       ├── missing ──► put(new document, seq = next) ──► is_new = true   │
//! │       │                    │                                            │
//! │       │                    └──► EventSink::on_appended (outbox)         │
//! │       │                                                                 │
//! │       ├── same payload ──► is_new = false (replay)                      │
//! │       │                                                                 │
//! │       └── different payload ──► warn! + conflict log                    │
//! │                                 original kept, is_new = false           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! First writer wins. Remote documents arriving through `merge_replicated`
//! go through the same rule while holding the same lock, so a pull never
//! overwrites a local event and a local append never overwrites a pulled one.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use tally_core::idempotency::resolve_identity;
use tally_core::validation::validate_event_key;
use tally_core::{now_millis, AppendOptions, AppendOutcome, Document, Event};

use crate::adapter::{IndexField, PersistenceAdapter, WriteOutcome};
use crate::error::{StoreError, StoreResult};

/// Conflict log capacity; older records are dropped first.
pub const CONFLICT_LOG_CAPACITY: usize = 256;

// =============================================================================
// Sink
// =============================================================================

/// Observer for newly stored events (the outbox implements this).
///
/// Called after the write lock is released, only when `is_new` is true.
/// Must not block.
pub trait EventSink: Send + Sync {
    fn on_appended(&self, event: &Event);
}

// =============================================================================
// Conflict Log
// =============================================================================

/// Where a conflicting write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSource {
    Local,
    Replication,
}

/// Two different payloads claimed the same event id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub existing_payload: Value,
    pub incoming_payload: Value,
    pub source: ConflictSource,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of a replicated batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// New ids written with their remote revision.
    pub inserted: usize,
    /// Ids already present with the same payload.
    pub unchanged: usize,
    /// Ids present with a different payload; local kept.
    pub conflicts: usize,
    /// Documents that can't be stored (bad id, no revision).
    pub skipped: usize,
}

// =============================================================================
// Event Store
// =============================================================================

/// Append-only event log for one named store.
pub struct EventStore {
    adapter: Arc<dyn PersistenceAdapter>,
    sink: Option<Arc<dyn EventSink>>,
    /// Next `seq`. Held across get+put and while merging.
    next_seq: AsyncMutex<u64>,
    conflicts: Mutex<VecDeque<ConflictRecord>>,
}

impl EventStore {
    /// Opens the log, seeding the sequence from the highest stored `seq`.
    pub async fn open(adapter: Arc<dyn PersistenceAdapter>) -> StoreResult<Self> {
        let last_seq = adapter
            .list_all()
            .await?
            .iter()
            .map(|doc| doc.event.seq)
            .max()
            .unwrap_or(0);

        info!(
            store = %adapter.name(),
            engine = %adapter.engine(),
            last_seq,
            "Event store opened"
        );

        Ok(EventStore {
            adapter,
            sink: None,
            next_seq: AsyncMutex::new(last_seq + 1),
            conflicts: Mutex::new(VecDeque::new()),
        })
    }

    /// Notifies `sink` of every newly stored event.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn adapter(&self) -> &Arc<dyn PersistenceAdapter> {
        &self.adapter
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Appends an event, or returns the one already stored under its id.
    ///
    /// ## Returns
    /// * `is_new = true` - this call stored the event
    /// * `is_new = false` - replay or idempotency conflict; the stored event
    ///   is returned unchanged
    /// * `Err` - invalid type/key, or a storage failure
    pub async fn append(
        &self,
        event_type: &str,
        payload: Value,
        options: AppendOptions,
    ) -> StoreResult<AppendOutcome> {
        let identity = resolve_identity(event_type, &options)?;
        let id = identity.into_id();

        let outcome = {
            let mut next_seq = self.next_seq.lock().await;

            match self.adapter.get(&id).await? {
                Some(existing) => self.replay(existing, payload),
                None => {
                    let event = Event {
                        id: id.clone(),
                        seq: *next_seq,
                        event_type: event_type.to_string(),
                        at: now_millis(),
                        payload,
                        aggregate: options.aggregate,
                        version: None,
                    };

                    match self.adapter.put(Document::from_event(event.clone())).await {
                        Ok(_) => {
                            *next_seq += 1;
                            debug!(id = %id, seq = event.seq, event_type = %event_type, "Event appended");
                            AppendOutcome {
                                id,
                                is_new: true,
                                event,
                            }
                        }
                        // Another writer on the same engine got there first.
                        Err(StoreError::RevisionConflict { .. }) => {
                            let existing = self
                                .adapter
                                .get(&id)
                                .await?
                                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                            self.replay(existing, event.payload)
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        };

        if outcome.is_new {
            if let Some(sink) = &self.sink {
                sink.on_appended(&outcome.event);
            }
        }

        Ok(outcome)
    }

    /// Same id already stored: replay or conflict.
    fn replay(&self, existing: Document, payload: Value) -> AppendOutcome {
        let stored = existing.into_event();

        if stored.payload != payload {
            self.record_conflict(&stored, payload, ConflictSource::Local);
        } else {
            debug!(id = %stored.id, "Idempotent replay");
        }

        AppendOutcome {
            id: stored.id.clone(),
            is_new: false,
            event: stored,
        }
    }

    fn record_conflict(&self, stored: &Event, incoming: Value, source: ConflictSource) {
        warn!(
            id = %stored.id,
            source = ?source,
            existing = %stored.payload,
            incoming = %incoming,
            "Idempotency conflict: keeping the original event"
        );

        let mut log = self.conflicts.lock();
        if log.len() == CONFLICT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(ConflictRecord {
            id: stored.id.clone(),
            existing_payload: stored.payload.clone(),
            incoming_payload: incoming,
            source,
            detected_at: Utc::now(),
        });
    }

    /// Merges remote-originated documents under the first-writer-wins rule.
    ///
    /// Unknown ids are written with their remote revision. Known ids with
    /// the same payload are left alone unless the remote revision is newer
    /// (e.g. a tombstone), in which case the adapter takes it.
    pub async fn merge_replicated(&self, docs: Vec<Document>) -> StoreResult<MergeReport> {
        let mut report = MergeReport::default();
        let mut next_seq = self.next_seq.lock().await;
        let mut to_write = Vec::new();

        for doc in docs {
            if doc.rev.is_none() || doc.id != doc.event.id || validate_event_key(&doc.id).is_err() {
                debug!(id = %doc.id, "Skipping unstorable replicated document");
                report.skipped += 1;
                continue;
            }

            match self.adapter.get(&doc.id).await? {
                None => to_write.push(doc),
                Some(local) if local.event.payload != doc.event.payload => {
                    report.conflicts += 1;
                    let incoming = doc.event.payload;
                    self.record_conflict(&local.into_event(), incoming, ConflictSource::Replication);
                }
                Some(local) => {
                    report.unchanged += 1;
                    if doc.rev > local.rev {
                        to_write.push(doc);
                    }
                }
            }
        }

        if let Some(max_seq) = to_write.iter().map(|doc| doc.event.seq).max() {
            *next_seq = (*next_seq).max(max_seq + 1);
        }

        if !to_write.is_empty() {
            let results = self.adapter.bulk_put(to_write).await?;
            report.inserted = results
                .iter()
                .filter(|r| r.outcome == WriteOutcome::Created)
                .count();
        }

        if report.conflicts > 0 || report.inserted > 0 {
            info!(
                inserted = report.inserted,
                unchanged = report.unchanged,
                conflicts = report.conflicts,
                skipped = report.skipped,
                "Replicated batch merged"
            );
        }

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// A single live event.
    pub async fn get(&self, id: &str) -> StoreResult<Option<Event>> {
        Ok(self
            .adapter
            .get(id)
            .await?
            .filter(|doc| !doc.deleted)
            .map(Document::into_event))
    }

    /// Every live event, ordered by `seq`.
    pub async fn get_all(&self) -> StoreResult<Vec<Event>> {
        Ok(self
            .adapter
            .list_all()
            .await?
            .into_iter()
            .map(Document::into_event)
            .collect())
    }

    /// Events of one aggregate, ordered by `at`. Unknown ids give an empty vec.
    pub async fn get_by_aggregate(&self, aggregate_id: &str) -> StoreResult<Vec<Event>> {
        self.indexed(IndexField::AggregateId, aggregate_id, |doc| {
            doc.event.aggregate_id() == Some(aggregate_id)
        })
        .await
    }

    /// Events of one type, ordered by `at`.
    pub async fn events_by_type(&self, event_type: &str) -> StoreResult<Vec<Event>> {
        self.indexed(IndexField::EventType, event_type, |doc| {
            doc.event.event_type == event_type
        })
        .await
    }

    /// Native index lookup, full scan when the engine can't serve it.
    async fn indexed<F>(&self, field: IndexField, value: &str, matches: F) -> StoreResult<Vec<Event>>
    where
        F: Fn(&Document) -> bool,
    {
        let docs = match self.adapter.find_by(field, value).await {
            Ok(docs) => docs,
            Err(e) => {
                debug!(field = %field, reason = %e, "Index lookup unavailable, scanning");
                self.adapter
                    .list_all()
                    .await?
                    .into_iter()
                    .filter(|doc| matches(doc))
                    .collect()
            }
        };

        let mut events: Vec<Event> = docs
            .into_iter()
            .filter(|doc| !doc.deleted)
            .map(Document::into_event)
            .collect();
        events.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.seq.cmp(&b.seq)));
        Ok(events)
    }

    /// Snapshot of the conflict log, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().iter().cloned().collect()
    }

    /// Destroys the underlying store. Ops and test tooling only.
    pub async fn reset(&self) -> StoreResult<()> {
        let mut next_seq = self.next_seq.lock().await;
        self.adapter.destroy().await?;
        *next_seq = 1;
        self.conflicts.lock().clear();
        warn!(store = %self.adapter.name(), "Event store reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{KvAdapter, MemoryKv, SqliteAdapter, SqliteConfig};
    use serde_json::json;
    use tally_core::{AggregateRef, Revision};

    async fn sqlite_store() -> EventStore {
        let adapter = SqliteAdapter::open("test_events", SqliteConfig::in_memory())
            .await
            .unwrap();
        EventStore::open(Arc::new(adapter)).await.unwrap()
    }

    async fn kv_store() -> EventStore {
        let adapter = KvAdapter::open("test_events", Arc::new(MemoryKv::new()))
            .await
            .unwrap();
        EventStore::open(Arc::new(adapter)).await.unwrap()
    }

    fn sale(id: &str) -> AppendOptions {
        AppendOptions::new().with_aggregate(AggregateRef::new(id, "sale"))
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn on_appended(&self, event: &Event) {
            self.seen.lock().push(event.id.clone());
        }
    }

    #[tokio::test]
    async fn test_sale_recorded_twice_with_key() {
        for store in [sqlite_store().await, kv_store().await] {
            let first = store
                .append("sale.recorded", json!({ "total": 24.18 }), AppendOptions::new().with_key("k1"))
                .await
                .unwrap();
            let second = store
                .append("sale.recorded", json!({ "total": 24.18 }), AppendOptions::new().with_key("k1"))
                .await
                .unwrap();

            assert_eq!(first.id, "k1");
            assert_eq!(second.id, "k1");
            assert!(first.is_new);
            assert!(!second.is_new);

            let all = store.get_all().await.unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].event_type, "sale.recorded");
            assert_eq!(all[0].payload["total"], 24.18);
        }
    }

    #[tokio::test]
    async fn test_repeated_appends_store_once() {
        let store = sqlite_store().await;
        let mut flags = Vec::new();
        for _ in 0..5 {
            let outcome = store
                .append("stock.moved", json!({ "qty": 2 }), AppendOptions::new().with_key("m-1"))
                .await
                .unwrap();
            assert_eq!(outcome.id, "m-1");
            flags.push(outcome.is_new);
        }
        assert_eq!(flags, vec![true, false, false, false, false]);
        assert_eq!(store.get_all().await.unwrap().len(), 1);
        assert!(store.conflicts().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_payload_keeps_original() {
        let store = kv_store().await;
        let original = store
            .append("sale.recorded", json!({ "total": 10 }), AppendOptions::new().with_key("k1"))
            .await
            .unwrap();
        let retry = store
            .append("sale.recorded", json!({ "total": 99 }), AppendOptions::new().with_key("k1"))
            .await
            .unwrap();

        assert!(!retry.is_new);
        assert_eq!(retry.event, original.event);
        assert_eq!(store.get("k1").await.unwrap().unwrap().payload, json!({ "total": 10 }));

        let conflicts = store.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].source, ConflictSource::Local);
        assert_eq!(conflicts[0].incoming_payload, json!({ "total": 99 }));
    }

    #[tokio::test]
    async fn test_derived_and_random_identity() {
        let store = sqlite_store().await;
        let params = json!({ "receipt": 42 });

        let a = store
            .append("sale.recorded", json!({}), sale("s-1").with_params(params.clone()))
            .await
            .unwrap();
        let b = store
            .append("sale.recorded", json!({}), sale("s-1").with_params(params))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("h-"));
        assert!(!b.is_new);

        let c = store.append("shift.started", json!({}), AppendOptions::new()).await.unwrap();
        let d = store.append("shift.started", json!({}), AppendOptions::new()).await.unwrap();
        assert!(c.is_new && d.is_new);
        assert_ne!(c.id, d.id);
    }

    #[tokio::test]
    async fn test_seq_follows_call_order_and_survives_reopen() {
        let adapter: Arc<dyn PersistenceAdapter> = Arc::new(
            KvAdapter::open("test_events", Arc::new(MemoryKv::new()))
                .await
                .unwrap(),
        );
        let store = EventStore::open(Arc::clone(&adapter)).await.unwrap();
        for i in 0..3 {
            store
                .append("sale.recorded", json!({ "i": i }), AppendOptions::new())
                .await
                .unwrap();
        }
        let seqs: Vec<u64> = store.get_all().await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let reopened = EventStore::open(adapter).await.unwrap();
        let next = reopened
            .append("sale.recorded", json!({}), AppendOptions::new())
            .await
            .unwrap();
        assert_eq!(next.event.seq, 4);
    }

    #[tokio::test]
    async fn test_aggregate_isolation_on_both_engines() {
        for store in [sqlite_store().await, kv_store().await] {
            store.append("sale.recorded", json!({ "n": 1 }), sale("A")).await.unwrap();
            store.append("sale.recorded", json!({ "n": 2 }), sale("B")).await.unwrap();
            store.append("sale.voided", json!({ "n": 3 }), sale("A")).await.unwrap();

            let a = store.get_by_aggregate("A").await.unwrap();
            assert_eq!(a.len(), 2);
            assert!(a.iter().all(|e| e.aggregate_id() == Some("A")));
            assert!(a[0].at <= a[1].at);

            assert!(store.get_by_aggregate("missing").await.unwrap().is_empty());

            let voided = store.events_by_type("sale.voided").await.unwrap();
            assert_eq!(voided.len(), 1);
            assert_eq!(voided[0].payload, json!({ "n": 3 }));
        }
    }

    #[tokio::test]
    async fn test_round_trip_modulo_seq() {
        let store = sqlite_store().await;
        let outcome = store
            .append("transfer.completed", json!({ "lines": [1, 2] }), sale("t-1").with_key("t-1"))
            .await
            .unwrap();

        let all = store.get_all().await.unwrap();
        assert!(all.iter().any(|e| e.same_fact(&outcome.event)));
    }

    #[tokio::test]
    async fn test_sink_sees_new_events_only() {
        let sink = Arc::new(RecordingSink::default());
        let store = kv_store().await.with_sink(sink.clone());

        store.append("sale.recorded", json!({}), sale("s").with_key("k1")).await.unwrap();
        store.append("sale.recorded", json!({}), sale("s").with_key("k1")).await.unwrap();
        store.append("sale.recorded", json!({}), sale("s").with_key("k2")).await.unwrap();

        assert_eq!(*sink.seen.lock(), vec!["k1".to_string(), "k2".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_replicated_rules() {
        let store = sqlite_store().await;
        store
            .append("sale.recorded", json!({ "total": 1 }), AppendOptions::new().with_key("local"))
            .await
            .unwrap();

        let remote = |id: &str, total: i64, rev: &str| {
            Document::from_event(Event {
                id: id.to_string(),
                seq: 40,
                event_type: "sale.recorded".to_string(),
                at: 5,
                payload: json!({ "total": total }),
                aggregate: None,
                version: None,
            })
            .with_rev(rev.parse::<Revision>().unwrap())
        };

        let mut no_rev = remote("norev", 1, "1-a");
        no_rev.rev = None;

        let report = store
            .merge_replicated(vec![
                remote("fresh", 5, "1-r"),
                remote("local", 1, "1-r"),
                remote("local", 2, "9-r"),
                remote("_design", 1, "1-r"),
                no_rev,
            ])
            .await
            .unwrap();

        assert_eq!(
            report,
            MergeReport {
                inserted: 1,
                unchanged: 1,
                conflicts: 1,
                skipped: 2,
            }
        );
        assert_eq!(store.get("local").await.unwrap().unwrap().payload, json!({ "total": 1 }));
        assert_eq!(store.get("fresh").await.unwrap().unwrap().seq, 40);
        assert_eq!(store.conflicts()[0].source, ConflictSource::Replication);

        // Local seq continues past replicated ones.
        let next = store.append("sale.recorded", json!({}), AppendOptions::new()).await.unwrap();
        assert_eq!(next.event.seq, 41);
    }

    #[tokio::test]
    async fn test_conflict_log_is_bounded() {
        let store = kv_store().await;
        store
            .append("sale.recorded", json!(0), AppendOptions::new().with_key("k"))
            .await
            .unwrap();
        for i in 1..=(CONFLICT_LOG_CAPACITY + 10) {
            store
                .append("sale.recorded", json!(i), AppendOptions::new().with_key("k"))
                .await
                .unwrap();
        }
        let conflicts = store.conflicts();
        assert_eq!(conflicts.len(), CONFLICT_LOG_CAPACITY);
        assert_eq!(conflicts[0].incoming_payload, json!(11));
    }

    #[tokio::test]
    async fn test_reset_destroys_everything() {
        let store = sqlite_store().await;
        store.append("sale.recorded", json!({}), AppendOptions::new()).await.unwrap();
        store.reset().await.unwrap();

        assert!(store.get_all().await.unwrap().is_empty());
        let outcome = store.append("sale.recorded", json!({}), AppendOptions::new()).await.unwrap();
        assert_eq!(outcome.event.seq, 1);
    }

    #[tokio::test]
    async fn test_invalid_key_is_an_error() {
        let store = kv_store().await;
        let result = store
            .append("sale.recorded", json!({}), AppendOptions::new().with_key("rev_counter"))
            .await;
        assert!(matches!(result, Err(StoreError::Core(_))));
    }
}
