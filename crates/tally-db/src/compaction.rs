//! # Compaction Manager
//!
//! Periodic storage maintenance against one adapter.
//!
//! ## Tick Decision
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Compaction Tick                                  │
//! │                                                                         │
//! │  metrics() ──✗──► Skipped(MetricsUnavailable)                           │
//! │     │                                                                   │
//! │     ├── compact_running or own guard set ──► Skipped(AlreadyRunning)    │
//! │     ├── last success < cooldown ago      ──► Skipped(CoolingDown)       │
//! │     ├── total_size > threshold_mb                      ─┐               │
//! │     ├── fragmentation > 0.30 and documents > 1000      ─┴─► compact     │
//! │     └── otherwise                        ──► Skipped(BelowThreshold)    │
//! │                                                                         │
//! │  compact:  attempt ─✗─ fixed delay ─► attempt ─✗─ ... (max_retries + 1) │
//! │  attempt:  adapter.compact() → poll compaction_state() until done       │
//! │                                                                         │
//! │  force_compaction(): skips cooldown + thresholds, keeps running guard   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here returns an error: failures end up in `CompactionResult`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tally_core::{CompactionSettings, StorageMetrics};

use crate::adapter::{CompactionState, PersistenceAdapter};

// =============================================================================
// Outcomes
// =============================================================================

/// Report of one compaction run (all attempts).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub success: bool,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub bytes_reclaimed: u64,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Why a tick did not compact.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    AlreadyRunning,
    CoolingDown { remaining: Duration },
    BelowThreshold,
    MetricsUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Compacted(CompactionResult),
    Skipped(SkipReason),
}

// =============================================================================
// Manager
// =============================================================================

struct Inner {
    adapter: Arc<dyn PersistenceAdapter>,
    settings: CompactionSettings,
    running: AtomicBool,
    last_success: Mutex<Option<Instant>>,
    last_result: Mutex<Option<CompactionResult>>,
}

/// Handle to the background timer loop.
struct LoopHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Storage maintenance scheduler. Clones share state.
#[derive(Clone)]
pub struct CompactionManager {
    inner: Arc<Inner>,
    handle: Arc<Mutex<Option<LoopHandle>>>,
}

impl CompactionManager {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>, settings: CompactionSettings) -> Self {
        CompactionManager {
            inner: Arc::new(Inner {
                adapter,
                settings,
                running: AtomicBool::new(false),
                last_success: Mutex::new(None),
                last_result: Mutex::new(None),
            }),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Tick interval for this host.
    pub fn interval(&self) -> Duration {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.inner.settings.interval_for(cpus)
    }

    /// Starts the timer loop. Starting twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            debug!("Compaction loop already running");
            return;
        }

        let period = self.interval();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let manager = self.clone();

        let task = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Compaction loop starting");

            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match manager.tick().await {
                            TickOutcome::Compacted(result) => debug!(success = result.success, "Compaction tick ran"),
                            TickOutcome::Skipped(reason) => debug!(?reason, "Compaction tick skipped"),
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Compaction loop shutting down");
                        break;
                    }
                }
            }
        });

        *handle = Some(LoopHandle { shutdown_tx, task });
    }

    /// Stops the timer loop. A compaction in flight runs to completion.
    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(()).await;
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Compaction loop ended abnormally");
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Latest compaction result, if any run happened.
    pub fn last_result(&self) -> Option<CompactionResult> {
        self.inner.last_result.lock().clone()
    }

    /// One scheduled check.
    pub async fn tick(&self) -> TickOutcome {
        let metrics = match self.inner.adapter.metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(error = %e, "Could not read storage metrics");
                return TickOutcome::Skipped(SkipReason::MetricsUnavailable(e.to_string()));
            }
        };

        if metrics.compact_running || self.inner.running.load(Ordering::SeqCst) {
            return TickOutcome::Skipped(SkipReason::AlreadyRunning);
        }

        if let Some(last) = *self.inner.last_success.lock() {
            let elapsed = last.elapsed();
            let cooldown = self.inner.settings.cooldown();
            if elapsed < cooldown {
                return TickOutcome::Skipped(SkipReason::CoolingDown {
                    remaining: cooldown - elapsed,
                });
            }
        }

        if !self.should_compact(&metrics) {
            return TickOutcome::Skipped(SkipReason::BelowThreshold);
        }

        info!(
            total_size = metrics.total_size,
            fragmentation = metrics.fragmentation_ratio,
            documents = metrics.document_count,
            "Storage thresholds crossed, compacting"
        );
        self.run(metrics).await
    }

    /// Compacts now regardless of cooldown and thresholds.
    pub async fn force_compaction(&self) -> TickOutcome {
        let metrics = match self.inner.adapter.metrics().await {
            Ok(metrics) => metrics,
            Err(e) => return TickOutcome::Skipped(SkipReason::MetricsUnavailable(e.to_string())),
        };

        if metrics.compact_running {
            return TickOutcome::Skipped(SkipReason::AlreadyRunning);
        }

        info!("Forced compaction requested");
        self.run(metrics).await
    }

    fn should_compact(&self, metrics: &StorageMetrics) -> bool {
        let settings = &self.inner.settings;
        metrics.total_size > settings.threshold_bytes()
            || (metrics.fragmentation_ratio > settings.fragmentation_threshold
                && metrics.document_count > settings.min_documents)
    }

    /// Runs all attempts under the running guard.
    async fn run(&self, before: StorageMetrics) -> TickOutcome {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return TickOutcome::Skipped(SkipReason::AlreadyRunning);
        }

        let started = Instant::now();
        let mut schedule = self.inner.settings.retry_policy().schedule();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            match self.attempt().await {
                Ok(()) => break Ok(()),
                Err(reason) => {
                    warn!(attempt = attempts, reason = %reason, "Compaction attempt failed");
                    match schedule.next_delay() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => break Err(reason),
                    }
                }
            }
        };

        let bytes_after = match self.inner.adapter.metrics().await {
            Ok(after) => after.total_size,
            Err(_) => before.total_size,
        };

        let result = CompactionResult {
            success: outcome.is_ok(),
            bytes_before: before.total_size,
            bytes_after,
            bytes_reclaimed: before.total_size.saturating_sub(bytes_after),
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
            error: outcome.err(),
        };

        if result.success {
            *self.inner.last_success.lock() = Some(Instant::now());
            info!(
                reclaimed = result.bytes_reclaimed,
                duration_ms = result.duration_ms,
                attempts = result.attempts,
                "Compaction succeeded"
            );
        } else {
            error!(
                attempts = result.attempts,
                error = ?result.error,
                "Compaction failed after all retries"
            );
        }

        *self.inner.last_result.lock() = Some(result.clone());
        self.inner.running.store(false, Ordering::SeqCst);

        TickOutcome::Compacted(result)
    }

    /// Starts the engine primitive and polls until it settles.
    async fn attempt(&self) -> Result<(), String> {
        let adapter = &self.inner.adapter;
        adapter.compact().await.map_err(|e| e.to_string())?;

        let deadline = Instant::now() + self.inner.settings.poll_timeout();
        loop {
            match adapter.compaction_state().await {
                CompactionState::Running => {
                    if Instant::now() >= deadline {
                        return Err("timed out waiting for compaction".to_string());
                    }
                    tokio::time::sleep(self.inner.settings.poll_interval()).await;
                }
                CompactionState::Finished | CompactionState::Idle => return Ok(()),
                CompactionState::Failed(reason) => return Err(reason),
            }
        }
    }
}
