//! Shared fixtures and the contract every engine must satisfy.

use std::time::Duration;

use serde_json::json;
use tally_core::{AggregateRef, Document, Event, StorageEngine};

use super::{CompactionState, IndexField, PersistenceAdapter, WriteOutcome};
use crate::error::StoreError;

/// Builds an unsaved document.
pub(crate) fn doc(id: &str, event_type: &str, aggregate: Option<&str>, at: i64, seq: u64) -> Document {
    Document::from_event(Event {
        id: id.to_string(),
        seq,
        event_type: event_type.to_string(),
        at,
        payload: json!({ "n": seq }),
        aggregate: aggregate.map(|a| AggregateRef::new(a, "sale")),
        version: None,
    })
}

pub(crate) async fn wait_for_compaction(adapter: &dyn PersistenceAdapter) -> CompactionState {
    for _ in 0..200 {
        let state = adapter.compaction_state().await;
        if !state.is_running() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    adapter.compaction_state().await
}

pub(crate) async fn exercise_contract(adapter: &dyn PersistenceAdapter) {
    // put: create, update, stale writers
    let created = adapter.put(doc("b", "sale.recorded", Some("s-1"), 20, 2)).await.unwrap();
    assert_eq!(created.outcome, WriteOutcome::Created);
    assert_eq!(created.rev.generation(), 1);

    let updated = adapter
        .put(doc("b", "sale.recorded", Some("s-1"), 20, 2).with_rev(created.rev.clone()))
        .await
        .unwrap();
    assert_eq!(updated.outcome, WriteOutcome::Updated);
    assert_eq!(updated.rev.generation(), 2);

    let stale = adapter
        .put(doc("b", "sale.recorded", Some("s-1"), 20, 2).with_rev(created.rev.clone()))
        .await;
    assert!(matches!(stale, Err(StoreError::RevisionConflict { .. })));
    let blind = adapter.put(doc("b", "sale.recorded", Some("s-1"), 20, 2)).await;
    assert!(matches!(blind, Err(StoreError::RevisionConflict { .. })));

    let stored = adapter.get("b").await.unwrap().unwrap();
    assert_eq!(stored.rev, Some(updated.rev.clone()));
    assert_eq!(stored.aggregate_id.as_deref(), Some("s-1"));

    // bulk_put: revisions preserved
    let remote = doc("a", "stock.moved", Some("s-2"), 10, 1).with_rev("3-remote".parse().unwrap());
    let results = adapter
        .bulk_put(vec![
            remote.clone(),
            doc("b", "sale.recorded", Some("s-1"), 20, 2).with_rev("1-old".parse().unwrap()),
        ])
        .await
        .unwrap();
    assert_eq!(results[0].outcome, WriteOutcome::Created);
    assert_eq!(results[0].rev.to_string(), "3-remote");
    assert_eq!(results[1].outcome, WriteOutcome::Unchanged);
    assert_eq!(results[1].rev, updated.rev);

    let newer = adapter
        .bulk_put(vec![remote.clone().with_rev("4-remote".parse().unwrap())])
        .await
        .unwrap();
    assert_eq!(newer[0].outcome, WriteOutcome::Updated);

    adapter.put(doc("c", "sale.recorded", Some("s-1"), 5, 3)).await.unwrap();

    // list_all: event seq order
    let ids: Vec<String> = adapter
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    // find_by: native on indexed engines only
    match adapter.engine() {
        StorageEngine::KeyValue => {
            assert!(matches!(
                adapter.find_by(IndexField::AggregateId, "s-1").await,
                Err(StoreError::Unsupported { .. })
            ));
        }
        _ => {
            let by_aggregate = adapter.find_by(IndexField::AggregateId, "s-1").await.unwrap();
            let ids: Vec<&str> = by_aggregate.iter().map(|d| d.id.as_str()).collect();
            assert_eq!(ids, vec!["c", "b"]);

            let by_type = adapter.find_by(IndexField::EventType, "stock.moved").await.unwrap();
            assert_eq!(by_type.len(), 1);
            assert!(adapter
                .find_by(IndexField::AggregateId, "nope")
                .await
                .unwrap()
                .is_empty());
        }
    }

    // remove: tombstone hidden from listings, visible in get and the feed
    let c_rev = adapter.get("c").await.unwrap().unwrap().rev.unwrap();
    let removed = adapter.remove("c", &c_rev).await.unwrap();
    assert_eq!(removed.rev.generation(), 2);
    assert!(adapter.get("c").await.unwrap().unwrap().deleted);
    assert_eq!(adapter.list_all().await.unwrap().len(), 2);
    assert!(adapter.remove("c", &c_rev).await.unwrap_err().is_conflict());

    // changes feed: strictly increasing, latest write last
    let changes = adapter.changes_since(0, 100).await.unwrap();
    assert_eq!(changes.len(), 3);
    assert!(changes.windows(2).all(|w| w[0].seq < w[1].seq));
    let last = changes.last().unwrap();
    assert_eq!(last.doc.id, "c");
    assert!(last.doc.deleted);

    let tail = adapter.changes_since(changes[0].seq, 1).await.unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].seq, changes[1].seq);
    assert!(adapter.changes_since(last.seq, 100).await.unwrap().is_empty());

    // metrics / usage
    let metrics = adapter.metrics().await.unwrap();
    assert_eq!(metrics.document_count, 2);
    assert!(metrics.deleted_count >= 1);
    assert_eq!(metrics.update_seq, last.seq);
    assert_eq!(adapter.usage().await.unwrap().items, 2);

    // metadata
    assert!(adapter.get_meta("push").await.unwrap().is_none());
    adapter.put_meta("push", json!("12")).await.unwrap();
    adapter.put_meta("push", json!("13")).await.unwrap();
    assert_eq!(adapter.get_meta("push").await.unwrap(), Some(json!("13")));
    assert_eq!(adapter.list_all().await.unwrap().len(), 2);

    // destroy
    adapter.destroy().await.unwrap();
    assert!(adapter.list_all().await.unwrap().is_empty());
    assert!(adapter.get("a").await.unwrap().is_none());
    assert!(adapter.get_meta("push").await.unwrap().is_none());
    assert_eq!(adapter.metrics().await.unwrap().document_count, 0);
}
