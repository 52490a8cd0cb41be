//! # Replication Directions
//!
//! One live loop per direction. Each loop owns its checkpoint and its
//! backoff schedule and reports what happens through a channel.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Direction Loop                                   │
//! │                                                                         │
//! │  PUSH: changes_since(checkpoint) ──► remote.bulk_docs ──► checkpoint    │
//! │  PULL: remote.changes(checkpoint) ──► merge_replicated ──► checkpoint   │
//! │                                                                         │
//! │  step ok, n > 0  ──► Change{n} (Active first if we were paused)         │
//! │                      reset backoff, step again immediately              │
//! │  step ok, n = 0  ──► Paused (once), sleep(poll_interval)                │
//! │  step err        ──► Error, sleep(next backoff: 1 s, 2 s, ... 30 s)     │
//! │                                                                         │
//! │  Checkpoints live in the adapter's local metadata, keyed by a hash of   │
//! │  (local store, remote database URL, direction).                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tally_core::RetryPolicy;
use tally_db::EventStore;

use crate::error::SyncResult;
use crate::remote::RemoteReplica;
use crate::status::{Direction, DirectionEvent};

/// An event tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DirectionReport {
    pub generation: u64,
    pub direction: Direction,
    pub event: DirectionEvent,
}

/// Everything one direction loop needs.
pub(crate) struct DirectionContext {
    pub generation: u64,
    pub direction: Direction,
    pub store: Arc<EventStore>,
    pub remote: Arc<dyn RemoteReplica>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub reports: mpsc::UnboundedSender<DirectionReport>,
}

/// Metadata key holding the checkpoint for one direction.
pub fn checkpoint_key(store_name: &str, remote_url: &str, direction: Direction) -> String {
    let id = format!("{}\n{}\n{}", store_name, remote_url, direction);
    let hash = blake3::hash(id.as_bytes()).to_hex();
    format!("replication_{}_{}", direction, &hash.as_str()[..16])
}

impl DirectionContext {
    fn report(&self, event: DirectionEvent) {
        let _ = self.reports.send(DirectionReport {
            generation: self.generation,
            direction: self.direction,
            event,
        });
    }

    fn checkpoint_key(&self) -> String {
        checkpoint_key(self.store.adapter().name(), self.remote.url(), self.direction)
    }

    /// Runs until `shutdown_rx` fires.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(direction = %self.direction, remote = %self.remote.url(), "Replication direction starting");

        let mut schedule = self.retry.schedule();
        let mut prepared = false;
        let mut paused = false;

        loop {
            let delay = tokio::select! {
                result = self.step(&mut prepared) => match result {
                    Ok(0) => {
                        if !paused {
                            paused = true;
                            self.report(DirectionEvent::Paused);
                        }
                        schedule.reset();
                        Some(self.poll_interval)
                    }
                    Ok(docs) => {
                        if paused {
                            paused = false;
                            self.report(DirectionEvent::Active);
                        }
                        schedule.reset();
                        self.report(DirectionEvent::Change { docs });
                        None
                    }
                    Err(e) => {
                        paused = false;
                        let delay = schedule.next_delay().unwrap_or(self.poll_interval);
                        warn!(
                            direction = %self.direction,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Replication step failed"
                        );
                        self.report(DirectionEvent::Error(e.to_string()));
                        Some(delay)
                    }
                },

                _ = shutdown_rx.recv() => break,
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        info!(direction = %self.direction, "Replication direction stopped");
    }

    /// One batch. Returns the number of documents transferred.
    async fn step(&self, prepared: &mut bool) -> SyncResult<usize> {
        match self.direction {
            Direction::Push => {
                if !*prepared {
                    self.remote.ensure_database().await?;
                    *prepared = true;
                }
                self.push_once().await
            }
            Direction::Pull => self.pull_once().await,
        }
    }

    async fn push_once(&self) -> SyncResult<usize> {
        let adapter = self.store.adapter();
        let key = self.checkpoint_key();
        let since = adapter
            .get_meta(&key)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let changes = adapter.changes_since(since, self.batch_size).await?;
        let Some(last_seq) = changes.last().map(|c| c.seq) else {
            return Ok(0);
        };

        let docs: Vec<_> = changes.into_iter().map(|c| c.doc).collect();
        let report = self.remote.bulk_docs(docs).await?;

        for denied in report.denied {
            self.report(DirectionEvent::Denied {
                id: denied.id,
                reason: denied.reason,
            });
        }

        adapter.put_meta(&key, Value::from(last_seq)).await?;
        debug!(written = report.written, checkpoint = last_seq, "Pushed batch");
        Ok(report.written)
    }

    async fn pull_once(&self) -> SyncResult<usize> {
        let adapter = self.store.adapter();
        let key = self.checkpoint_key();
        let since = adapter
            .get_meta(&key)
            .await?
            .and_then(|v| v.as_str().map(str::to_string));

        let batch = self.remote.changes(since.as_deref(), self.batch_size).await?;
        if batch.docs.is_empty() {
            if since.as_deref() != Some(batch.last_seq.as_str()) {
                adapter.put_meta(&key, Value::from(batch.last_seq)).await?;
            }
            return Ok(0);
        }

        let received = batch.docs.len();
        let report = self.store.merge_replicated(batch.docs).await?;
        adapter.put_meta(&key, Value::from(batch.last_seq.clone())).await?;

        debug!(
            received,
            inserted = report.inserted,
            conflicts = report.conflicts,
            checkpoint = %batch.last_seq,
            "Pulled batch"
        );
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::AppendOptions;
    use tally_db::{KvAdapter, PersistenceAdapter};
    use tally_db::adapter::MemoryKv;

    use crate::remote::MemoryReplica;

    async fn store(name: &str) -> Arc<EventStore> {
        let adapter: Arc<dyn PersistenceAdapter> =
            Arc::new(KvAdapter::open(name, Arc::new(MemoryKv::new())).await.unwrap());
        Arc::new(EventStore::open(adapter).await.unwrap())
    }

    fn context(
        direction: Direction,
        store: Arc<EventStore>,
        remote: &MemoryReplica,
    ) -> (DirectionContext, mpsc::UnboundedReceiver<DirectionReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = DirectionContext {
            generation: 7,
            direction,
            store,
            remote: Arc::new(remote.clone()),
            batch_size: 2,
            poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30)),
            reports: tx,
        };
        (ctx, rx)
    }

    #[test]
    fn test_checkpoint_key_is_stable_and_distinct() {
        let push = checkpoint_key("tally_events", "memory://main", Direction::Push);
        assert_eq!(push, checkpoint_key("tally_events", "memory://main", Direction::Push));
        assert!(push.starts_with("replication_push_"));
        assert_ne!(push, checkpoint_key("tally_events", "memory://main", Direction::Pull));
        assert_ne!(push, checkpoint_key("tally_events", "memory://other", Direction::Push));
    }

    #[tokio::test]
    async fn test_push_batches_and_checkpoints() {
        let local = store("push_events").await;
        for i in 0..3 {
            local
                .append("sale.recorded", json!({ "i": i }), AppendOptions::new())
                .await
                .unwrap();
        }
        let remote = MemoryReplica::new("main");
        let (ctx, _rx) = context(Direction::Push, Arc::clone(&local), &remote);

        assert_eq!(ctx.push_once().await.unwrap(), 2);
        assert_eq!(ctx.push_once().await.unwrap(), 1);
        assert_eq!(ctx.push_once().await.unwrap(), 0);
        assert_eq!(remote.docs().len(), 3);

        let checkpoint = local.adapter().get_meta(&ctx.checkpoint_key()).await.unwrap();
        assert!(checkpoint.and_then(|v| v.as_u64()).is_some());
    }

    #[tokio::test]
    async fn test_pull_merges_and_checkpoints() {
        let origin = store("origin_events").await;
        origin
            .append("stock.moved", json!({ "qty": 4 }), AppendOptions::new().with_key("m1"))
            .await
            .unwrap();
        let remote = MemoryReplica::new("main");
        let (push, _) = context(Direction::Push, Arc::clone(&origin), &remote);
        push.push_once().await.unwrap();

        let local = store("local_events").await;
        let (pull, _) = context(Direction::Pull, Arc::clone(&local), &remote);
        assert_eq!(pull.pull_once().await.unwrap(), 1);
        assert_eq!(pull.pull_once().await.unwrap(), 0);

        let pulled = local.get("m1").await.unwrap().unwrap();
        assert_eq!(pulled.payload, json!({ "qty": 4 }));
        assert_eq!(
            local.adapter().get_meta(&pull.checkpoint_key()).await.unwrap(),
            Some(json!("1"))
        );
    }

    #[tokio::test]
    async fn test_denied_documents_are_reported() {
        let local = store("denied_events").await;
        local
            .append("sale.recorded", json!({ "total": 1 }), AppendOptions::new().with_key("k1"))
            .await
            .unwrap();
        let remote = MemoryReplica::new("main");
        remote.deny("k1");

        let (ctx, mut rx) = context(Direction::Push, local, &remote);
        assert_eq!(ctx.push_once().await.unwrap(), 0);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.generation, 7);
        assert!(matches!(report.event, DirectionEvent::Denied { ref id, .. } if id == "k1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_reports_error_then_recovers() {
        let local = store("loop_events").await;
        local
            .append("sale.recorded", json!({ "total": 1 }), AppendOptions::new())
            .await
            .unwrap();
        let remote = MemoryReplica::new("main");
        remote.set_reachable(false);

        let (ctx, mut rx) = context(Direction::Push, local, &remote);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(ctx.run(shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, DirectionEvent::Error(_)));

        remote.set_reachable(true);
        let mut events = Vec::new();
        while let Some(report) = rx.recv().await {
            let paused = report.event == DirectionEvent::Paused;
            events.push(report.event);
            if paused {
                break;
            }
        }
        assert!(events.contains(&DirectionEvent::Change { docs: 1 }));
        assert_eq!(remote.docs().len(), 1);

        shutdown_tx.send(()).await.unwrap();
        task.await.unwrap();
    }
}
