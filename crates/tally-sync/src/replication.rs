//! # Replication Manager
//!
//! Bidirectional replication of one event store against one remote
//! database, driven by a network-aware state machine.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     ReplicationManager                                  │
//! │                                                                         │
//! │  configure(remote) ── validate URL ──✗── Err(InvalidUrl)                │
//! │        │                                                                │
//! │        ├── connector.connect ──✗── state = unavailable                 │
//! │        ├── ping (bounded) ─────✗── state = error                       │
//! │        └── ok ──────────────────── state = idle                        │
//! │                                                                         │
//! │  start_replication()                                                    │
//! │        │   spawn push loop ─┐                                           │
//! │        │   spawn pull loop ─┼──► reports ──► fold task ──► state        │
//! │        └──────────────────────────────────────┘            watch + emit │
//! │                                                                         │
//! │  network offline  ──► stop loops, state = offline                      │
//! │  network online   ──► state = idle, after reconnect delay: restart     │
//! │  stop_replication ──► stop loops + pending restart, state = idle       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each session carries a generation number. Reports from a session that
//! has already been stopped are ignored.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tally_core::ReplicationSettings;
use tally_db::EventStore;

use crate::direction::{DirectionContext, DirectionReport};
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteConfig, RemoteReplica, ReplicaConnector};
use crate::status::{
    fold_state, Direction, DirectionEvent, DirectionState, NoOpEmitter, SyncEventEmitter,
    SyncState, SyncStatus,
};

// =============================================================================
// Internal State
// =============================================================================

struct DirectionHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// One start..stop span of the two direction loops.
struct Session {
    generation: u64,
    push: DirectionHandle,
    pull: DirectionHandle,
    fold: JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    status: SyncStatus,
    remote: Option<Arc<dyn RemoteReplica>>,
    session: Option<Session>,
    restart: Option<JoinHandle<()>>,
    network: Option<JoinHandle<()>>,
    generation: u64,
}

struct Inner {
    store: Arc<EventStore>,
    settings: ReplicationSettings,
    connector: Arc<dyn ReplicaConnector>,
    emitter: Arc<dyn SyncEventEmitter>,
    state_tx: watch::Sender<SyncState>,
    state: Mutex<ManagerState>,
}

impl Inner {
    /// Sets the visible state, notifying subscribers on change.
    fn transition(&self, state: &mut ManagerState, next: SyncState) {
        let previous = state.status.state;
        state.status.state = next;
        if previous != next {
            info!(from = %previous, to = %next, "Replication state changed");
            self.state_tx.send_replace(next);
        }
        self.emitter.emit_status(&state.status);
    }

    fn fail(&self, state: &mut ManagerState, next: SyncState, message: String) {
        self.emitter.emit_error(&message, next == SyncState::Error);
        state.status.last_error = Some(message);
        self.transition(state, next);
    }

    /// Applies one direction report to the folded state.
    fn apply(&self, report: DirectionReport) {
        let mut state = self.state.lock();
        let live = state
            .session
            .as_ref()
            .is_some_and(|s| s.generation == report.generation);
        if !live {
            debug!(generation = report.generation, "Ignoring report from stopped session");
            return;
        }

        let next = match report.event {
            DirectionEvent::Change { docs } => {
                match report.direction {
                    Direction::Push => state.status.docs_pushed += docs as u64,
                    Direction::Pull => state.status.docs_pulled += docs as u64,
                }
                state.status.last_change_at = Some(Utc::now());
                DirectionState::Active
            }
            DirectionEvent::Active => DirectionState::Active,
            DirectionEvent::Paused => DirectionState::Paused,
            DirectionEvent::Error(message) => {
                self.emitter.emit_error(&message, true);
                state.status.last_error = Some(message);
                DirectionState::Error
            }
            DirectionEvent::Denied { id, reason } => {
                warn!(direction = %report.direction, id = %id, reason = %reason, "Document denied by remote");
                self.emitter.emit_denied(report.direction, &id, &reason);
                return;
            }
        };

        match report.direction {
            Direction::Push => state.status.push = next,
            Direction::Pull => state.status.pull = next,
        }

        let folded = fold_state(state.status.push, state.status.pull);
        self.transition(&mut state, folded);
    }
}

/// Takes the live session out, leaving per-direction state stopped.
fn take_session(state: &mut ManagerState) -> Option<Session> {
    state.status.push = DirectionState::Stopped;
    state.status.pull = DirectionState::Stopped;
    state.session.take()
}

async fn shut_down(session: Session) {
    let _ = session.push.shutdown_tx.send(()).await;
    let _ = session.pull.shutdown_tx.send(()).await;
    session.push.task.abort();
    session.pull.task.abort();
    session.fold.abort();
    debug!(generation = session.generation, "Replication session stopped");
}

// =============================================================================
// Manager
// =============================================================================

/// Replication of one store against one remote. Clones share state.
#[derive(Clone)]
pub struct ReplicationManager {
    inner: Arc<Inner>,
}

impl ReplicationManager {
    pub fn new(
        store: Arc<EventStore>,
        settings: ReplicationSettings,
        connector: Arc<dyn ReplicaConnector>,
    ) -> Self {
        Self::with_emitter(store, settings, connector, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        store: Arc<EventStore>,
        settings: ReplicationSettings,
        connector: Arc<dyn ReplicaConnector>,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        ReplicationManager {
            inner: Arc::new(Inner {
                store,
                settings,
                connector,
                emitter,
                state_tx,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Current state, updated on every transition.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.lock().status.state
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.lock().status.clone()
    }

    pub fn is_configured(&self) -> bool {
        self.inner.state.lock().remote.is_some()
    }

    /// Points the manager at a remote and probes it. Never starts replication.
    ///
    /// ## Returns
    /// * `Ok(Idle)` - remote reachable
    /// * `Ok(Unavailable)` - the remote could not be constructed
    /// * `Ok(Error)` - probe failed or timed out
    /// * `Err(InvalidUrl)` - malformed URL
    pub async fn configure(&self, config: RemoteConfig) -> SyncResult<SyncState> {
        config.validate()?;

        let previous = {
            let mut state = self.inner.state.lock();
            state.remote = None;
            if let Some(restart) = state.restart.take() {
                restart.abort();
            }
            take_session(&mut state)
        };
        if let Some(session) = previous {
            shut_down(session).await;
        }

        let remote = match self.inner.connector.connect(&config) {
            Ok(remote) => remote,
            Err(e) => {
                error!(url = %config.url, error = %e, "Could not build remote replica");
                let mut state = self.inner.state.lock();
                self.inner.fail(&mut state, SyncState::Unavailable, e.to_string());
                return Ok(SyncState::Unavailable);
            }
        };

        let timeout = self.inner.settings.probe_timeout();
        let probe = match tokio::time::timeout(timeout, remote.ping()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(timeout.as_secs())),
        };

        let mut state = self.inner.state.lock();
        match probe {
            Ok(()) => {
                info!(remote = %remote.url(), "Remote replica configured");
                state.status.remote_db = Some(remote.url().to_string());
                state.status.last_error = None;
                state.remote = Some(remote);
                self.inner.transition(&mut state, SyncState::Idle);
                Ok(SyncState::Idle)
            }
            Err(e) => {
                warn!(remote = %remote.url(), error = %e, "Remote replica unreachable");
                self.inner.fail(&mut state, SyncState::Error, e.to_string());
                Ok(SyncState::Error)
            }
        }
    }

    /// Starts live push and pull. A no-op when already replicating.
    pub fn start_replication(&self) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        let remote = state.remote.clone().ok_or(SyncError::NotConfigured)?;

        if state.status.state == SyncState::Offline {
            debug!("Not starting replication while offline");
            return Err(SyncError::Offline);
        }
        if state.session.is_some() {
            return Ok(());
        }

        state.generation += 1;
        let generation = state.generation;
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let push = self.spawn_direction(generation, Direction::Push, &remote, reports_tx.clone());
        let pull = self.spawn_direction(generation, Direction::Pull, &remote, reports_tx);
        let fold = tokio::spawn(fold_reports(Arc::downgrade(&self.inner), reports_rx));

        state.session = Some(Session {
            generation,
            push,
            pull,
            fold,
        });
        state.status.push = DirectionState::Active;
        state.status.pull = DirectionState::Active;

        info!(generation, remote = %remote.url(), "Replication started");
        self.inner.transition(&mut state, SyncState::Active);
        Ok(())
    }

    fn spawn_direction(
        &self,
        generation: u64,
        direction: Direction,
        remote: &Arc<dyn RemoteReplica>,
        reports: mpsc::UnboundedSender<DirectionReport>,
    ) -> DirectionHandle {
        let settings = &self.inner.settings;
        let ctx = DirectionContext {
            generation,
            direction,
            store: Arc::clone(&self.inner.store),
            remote: Arc::clone(remote),
            batch_size: settings.batch_size,
            poll_interval: settings.poll_interval(),
            retry: settings.retry_policy(),
            reports,
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(ctx.run(shutdown_rx));
        DirectionHandle { shutdown_tx, task }
    }

    /// Cancels both directions and any pending restart.
    pub async fn stop_replication(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            if let Some(restart) = state.restart.take() {
                restart.abort();
            }
            let session = take_session(&mut state);
            if state.status.state != SyncState::Offline || session.is_some() {
                self.inner.transition(&mut state, SyncState::Idle);
            }
            session
        };

        if let Some(session) = session {
            shut_down(session).await;
            info!("Replication stopped");
        }
    }

    /// Reacts to a connectivity change.
    pub async fn set_online(&self, online: bool) {
        if online {
            let mut state = self.inner.state.lock();
            if state.status.state != SyncState::Offline {
                return;
            }
            info!("Network back online");
            self.inner.transition(&mut state, SyncState::Idle);

            if let Some(restart) = state.restart.take() {
                restart.abort();
            }
            let manager = self.clone();
            let delay = self.inner.settings.reconnect_delay();
            state.restart = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.inner.state.lock().restart = None;
                if let Err(e) = manager.start_replication() {
                    debug!(error = %e, "Replication not restarted");
                }
            }));
        } else {
            let session = {
                let mut state = self.inner.state.lock();
                if let Some(restart) = state.restart.take() {
                    restart.abort();
                }
                let session = take_session(&mut state);
                if state.status.state != SyncState::Offline {
                    info!(replicating = session.is_some(), "Network offline");
                }
                self.inner.transition(&mut state, SyncState::Offline);
                session
            };
            if let Some(session) = session {
                shut_down(session).await;
            }
        }
    }

    /// Follows an external connectivity signal until it closes.
    pub fn watch_network(&self, mut online: watch::Receiver<bool>) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let initial = *online.borrow_and_update();
            manager.set_online(initial).await;

            while online.changed().await.is_ok() {
                let value = *online.borrow_and_update();
                manager.set_online(value).await;
            }
            debug!("Network signal closed");
        });

        if let Some(previous) = self.inner.state.lock().network.replace(task) {
            previous.abort();
        }
    }

    /// Stops everything, including the network watcher.
    pub async fn shutdown(&self) {
        if let Some(network) = self.inner.state.lock().network.take() {
            network.abort();
        }
        self.stop_replication().await;
    }
}

/// Drains direction reports for one session.
async fn fold_reports(inner: Weak<Inner>, mut reports: mpsc::UnboundedReceiver<DirectionReport>) {
    while let Some(report) = reports.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(report);
    }
}
