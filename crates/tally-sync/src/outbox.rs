//! # Outbox
//!
//! Buffers newly appended events and relays them in the background.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Outbox                                       │
//! │                                                                         │
//! │  EventStore::append ──► on_appended ──► enqueue (aggregate events only) │
//! │                                            │                            │
//! │                                            ▼                            │
//! │                                   ┌─────────────────┐                   │
//! │                                   │   FIFO buffer   │                   │
//! │                                   └────────┬────────┘                   │
//! │                                            │ drain (notify / interval)  │
//! │                                            ▼                            │
//! │                                     relay.relay(event)                  │
//! │                                       │          │                      │
//! │                                    ok │          │ err                  │
//! │                                       ▼          ▼                      │
//! │                                    done    attempts + 1                 │
//! │                                            < max: back of the queue     │
//! │                                           >= max: dropped (error!)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Disabling stops the drain loop. Items already buffered stay queued and
//! are relayed by the next `flush()` or once the outbox is enabled again.
//! That includes an item whose relay was in flight when the loop stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tally_core::{Event, OutboxSettings};
use tally_db::EventSink;

use crate::relay::EventRelay;

#[derive(Debug, Clone)]
struct OutboxItem {
    event: Event,
    attempts: u32,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub relayed: usize,
    pub requeued: usize,
    pub dropped: usize,
}

struct LoopHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    relay: Arc<dyn EventRelay>,
    settings: OutboxSettings,
    queue: Mutex<VecDeque<OutboxItem>>,
    enabled: AtomicBool,
    wake: Notify,
    /// One drain pass at a time (loop and `flush`).
    draining: AsyncMutex<()>,
}

impl Inner {
    async fn drain(&self) -> DrainReport {
        let _guard = self.draining.lock().await;
        let max_attempts = self.settings.effective_max_attempts();
        let mut report = DrainReport::default();

        // Items requeued during this pass wait for the next one.
        let batch = self.queue.lock().len();
        for _ in 0..batch {
            // The head stays queued until its relay settles, so an aborted
            // pass leaves it in place. Only this pass removes from the front.
            let Some(head) = self.queue.lock().front().cloned() else {
                break;
            };

            let result = self.relay.relay(&head.event).await;
            let Some(mut item) = self.queue.lock().pop_front() else {
                break;
            };

            match result {
                Ok(()) => report.relayed += 1,
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts >= max_attempts {
                        error!(
                            id = %item.event.id,
                            attempts = item.attempts,
                            error = %e,
                            "Dropping event after exhausting relay attempts"
                        );
                        report.dropped += 1;
                    } else {
                        warn!(id = %item.event.id, attempts = item.attempts, error = %e, "Relay failed, requeued");
                        self.queue.lock().push_back(item);
                        report.requeued += 1;
                    }
                }
            }
        }

        if batch > 0 {
            debug!(
                relayed = report.relayed,
                requeued = report.requeued,
                dropped = report.dropped,
                "Outbox drained"
            );
        }
        report
    }
}

/// Asynchronous relay of new events. Clones share the same buffer.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
    handle: Arc<Mutex<Option<LoopHandle>>>,
}

impl Outbox {
    pub fn new(relay: Arc<dyn EventRelay>, settings: OutboxSettings) -> Self {
        Outbox {
            inner: Arc::new(Inner {
                relay,
                settings,
                queue: Mutex::new(VecDeque::new()),
                enabled: AtomicBool::new(false),
                wake: Notify::new(),
                draining: AsyncMutex::new(()),
            }),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Enables or disables relaying. Enabling twice is a no-op.
    pub async fn configure(&self, enabled: bool) {
        if enabled {
            if self.inner.enabled.swap(true, Ordering::SeqCst) {
                return;
            }
            self.spawn_loop();
            info!(pending = self.pending(), "Outbox enabled");
        } else {
            self.inner.enabled.store(false, Ordering::SeqCst);
            let handle = self.handle.lock().take();
            if let Some(handle) = handle {
                let _ = handle.shutdown_tx.send(()).await;
                handle.task.abort();
                info!(pending = self.pending(), "Outbox disabled");
            }
        }
    }

    fn spawn_loop(&self) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            info!("Outbox drain loop starting");
            let idle = inner.settings.drain_interval();
            let backoff = inner.settings.retry_delay();

            loop {
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(idle) => {}
                    _ = shutdown_rx.recv() => break,
                }

                let report = inner.drain().await;
                if report.requeued > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }

            info!("Outbox drain loop stopped");
        });

        *self.handle.lock() = Some(LoopHandle { shutdown_tx, task });
    }

    /// Buffers `event` for relay. Ignored while disabled or without aggregate.
    pub fn enqueue(&self, event: Event) {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            return;
        }
        if event.aggregate.is_none() {
            debug!(id = %event.id, "Skipping outbox for event without aggregate");
            return;
        }

        self.inner.queue.lock().push_back(OutboxItem { event, attempts: 0 });
        self.inner.wake.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// True while the drain loop is alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Runs one drain pass now.
    pub async fn flush(&self) -> DrainReport {
        self.inner.drain().await
    }
}

impl EventSink for Outbox {
    fn on_appended(&self, event: &Event) {
        self.enqueue(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tally_core::{AggregateRef, AppendOptions};
    use tally_db::adapter::MemoryKv;
    use tally_db::{EventStore, KvAdapter, PersistenceAdapter};

    use crate::error::{SyncError, SyncResult};

    /// Fails the first `failures` calls, then records ids.
    #[derive(Default)]
    struct ScriptedRelay {
        failures: AtomicUsize,
        calls: AtomicUsize,
        relayed: Mutex<Vec<String>>,
    }

    impl ScriptedRelay {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(ScriptedRelay {
                failures: AtomicUsize::new(failures),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl EventRelay for ScriptedRelay {
        async fn relay(&self, event: &Event) -> SyncResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SyncError::RelayFailed("503".into()));
            }
            self.relayed.lock().push(event.id.clone());
            Ok(())
        }
    }

    /// Never answers; signals once the first call is in flight.
    #[derive(Default)]
    struct StalledRelay {
        called: Notify,
    }

    #[async_trait]
    impl EventRelay for StalledRelay {
        async fn relay(&self, _event: &Event) -> SyncResult<()> {
            self.called.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn event(id: &str, aggregate: bool) -> Event {
        Event {
            id: id.into(),
            seq: 1,
            event_type: "transfer.completed".into(),
            at: 0,
            payload: json!({}),
            aggregate: aggregate.then(|| AggregateRef::new("t-1", "transfer")),
            version: None,
        }
    }

    fn settings(max_attempts: u32) -> OutboxSettings {
        OutboxSettings {
            enabled: true,
            endpoint: Some("http://relay.invalid".into()),
            max_attempts,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_and_aggregateless_events_are_ignored() {
        let relay = ScriptedRelay::failing(0);
        let outbox = Outbox::new(relay.clone(), settings(3));

        outbox.enqueue(event("e1", true));
        assert_eq!(outbox.pending(), 0);

        outbox.configure(true).await;
        outbox.enqueue(event("e2", false));
        assert_eq!(outbox.pending(), 0);
        outbox.configure(false).await;
    }

    #[tokio::test]
    async fn test_failed_item_is_requeued_at_tail() {
        let relay = ScriptedRelay::failing(1);
        let outbox = Outbox::new(relay.clone(), settings(3));
        outbox.inner.enabled.store(true, Ordering::SeqCst);

        outbox.enqueue(event("e1", true));
        outbox.enqueue(event("e2", true));

        let first = outbox.flush().await;
        assert_eq!(first, DrainReport { relayed: 1, requeued: 1, dropped: 0 });
        assert_eq!(*relay.relayed.lock(), vec!["e2".to_string()]);

        let second = outbox.flush().await;
        assert_eq!(second.relayed, 1);
        assert_eq!(*relay.relayed.lock(), vec!["e2".to_string(), "e1".to_string()]);
        assert_eq!(outbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_item_dropped_after_max_attempts_with_one_retry_floor() {
        let relay = ScriptedRelay::failing(usize::MAX);
        // max_attempts = 1 still allows one retry.
        let outbox = Outbox::new(relay.clone(), settings(1));
        outbox.inner.enabled.store(true, Ordering::SeqCst);
        outbox.enqueue(event("e1", true));

        assert_eq!(outbox.flush().await.requeued, 1);
        assert_eq!(outbox.flush().await.dropped, 1);
        assert_eq!(outbox.pending(), 0);
        assert_eq!(relay.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outbox.flush().await, DrainReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_relays_store_appends() {
        let relay = ScriptedRelay::failing(1);
        let outbox = Outbox::new(relay.clone(), settings(5));
        outbox.configure(true).await;
        outbox.configure(true).await;
        assert!(outbox.is_running());

        let adapter: Arc<dyn PersistenceAdapter> = Arc::new(
            KvAdapter::open("outbox_events", Arc::new(MemoryKv::new()))
                .await
                .unwrap(),
        );
        let store = EventStore::open(adapter)
            .await
            .unwrap()
            .with_sink(Arc::new(outbox.clone()));

        let appended = store
            .append(
                "transfer.completed",
                json!({ "qty": 2 }),
                AppendOptions::new()
                    .with_key("tr-1")
                    .with_aggregate(AggregateRef::new("t-1", "transfer")),
            )
            .await
            .unwrap();
        // A replay is not a new event.
        store
            .append(
                "transfer.completed",
                json!({ "qty": 2 }),
                AppendOptions::new()
                    .with_key("tr-1")
                    .with_aggregate(AggregateRef::new("t-1", "transfer")),
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if !relay.relayed.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(*relay.relayed.lock(), vec![appended.id]);
        assert_eq!(relay.calls.load(Ordering::SeqCst), 2);

        outbox.configure(false).await;
        assert!(!outbox.is_running());
        assert!(!outbox.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_keeps_in_flight_item() {
        let relay = Arc::new(StalledRelay::default());
        let outbox = Outbox::new(relay.clone(), settings(3));
        outbox.configure(true).await;

        outbox.enqueue(event("e1", true));
        relay.called.notified().await;
        assert_eq!(outbox.pending(), 1);

        outbox.configure(false).await;
        assert!(!outbox.is_running());
        assert_eq!(outbox.pending(), 1);

        // Still at the head for the next pass.
        let scripted = ScriptedRelay::failing(0);
        let resumed = Outbox {
            inner: Arc::new(Inner {
                relay: scripted.clone(),
                settings: settings(3),
                queue: Mutex::new(std::mem::take(&mut *outbox.inner.queue.lock())),
                enabled: AtomicBool::new(true),
                wake: Notify::new(),
                draining: AsyncMutex::new(()),
            }),
            handle: Arc::new(Mutex::new(None)),
        };
        assert_eq!(resumed.flush().await.relayed, 1);
        assert_eq!(*scripted.relayed.lock(), vec!["e1".to_string()]);
    }
}
