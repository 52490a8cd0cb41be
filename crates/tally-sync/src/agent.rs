//! # Sync Agent
//!
//! Wires the whole local-first stack from one [`TallyConfig`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SyncAgent::start                              │
//! │                                                                         │
//! │  1. validate config                                                     │
//! │  2. open_adapter(store)          SQLite, or key/value fallback          │
//! │  3. Outbox (+ HttpRelay)         only when outbox.enabled               │
//! │  4. EventStore::open             outbox registered as sink              │
//! │  5. Outbox enabled, compaction timer started                            │
//! │  6. ReplicationManager           configure + start when a URL is set    │
//! │                                                                         │
//! │  Steps 1-4 spawn nothing. A failure in step 6 shuts the rest down.      │
//! │  shutdown: replication → outbox (final flush) → compaction              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use tally_db::{open_adapter, CompactionManager, EventSink, EventStore};

use crate::config::TallyConfig;
use crate::error::{SyncError, SyncResult};
use crate::outbox::Outbox;
use crate::relay::{EventRelay, HttpRelay};
use crate::remote::{HttpConnector, ReplicaConnector};
use crate::replication::ReplicationManager;
use crate::status::{NoOpEmitter, SyncEventEmitter, SyncState, SyncStatus};

// =============================================================================
// Sync Agent
// =============================================================================

/// Components created by `start`.
struct Running {
    store: Arc<EventStore>,
    outbox: Option<Outbox>,
    compaction: CompactionManager,
    replication: ReplicationManager,
}

/// Owns the event store and every background service around it.
pub struct SyncAgent {
    config: TallyConfig,
    emitter: Arc<dyn SyncEventEmitter>,
    connector: Option<Arc<dyn ReplicaConnector>>,
    relay: Option<Arc<dyn EventRelay>>,
    running: Option<Running>,
}

impl SyncAgent {
    pub fn new(config: TallyConfig) -> Self {
        Self::with_emitter(config, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(config: TallyConfig, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        SyncAgent {
            config,
            emitter,
            connector: None,
            relay: None,
            running: None,
        }
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// The event store. `None` before `start`.
    pub fn store(&self) -> Option<Arc<EventStore>> {
        self.running.as_ref().map(|r| Arc::clone(&r.store))
    }

    pub fn replication(&self) -> Option<&ReplicationManager> {
        self.running.as_ref().map(|r| &r.replication)
    }

    pub fn compaction(&self) -> Option<&CompactionManager> {
        self.running.as_ref().map(|r| &r.compaction)
    }

    pub fn outbox(&self) -> Option<&Outbox> {
        self.running.as_ref().and_then(|r| r.outbox.as_ref())
    }

    /// Replication status; default (idle) before `start`.
    pub fn status(&self) -> SyncStatus {
        self.replication()
            .map(ReplicationManager::status)
            .unwrap_or_default()
    }

    /// Opens storage and starts the background services. Starting twice is a no-op.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.running.is_some() {
            return Ok(());
        }

        self.config.validate()?;

        info!(
            store = %self.config.store.store_name(),
            engine = ?self.config.store.engine,
            replication = self.config.is_replication_configured(),
            outbox = self.config.outbox.enabled,
            "Starting sync agent"
        );

        let adapter = open_adapter(&self.config.store).await?;

        let outbox = if self.config.outbox.enabled {
            Some(Outbox::new(self.relay()?, self.config.outbox.clone()))
        } else {
            None
        };

        let mut store = EventStore::open(Arc::clone(&adapter)).await?;
        if let Some(outbox) = &outbox {
            let sink: Arc<dyn EventSink> = Arc::new(outbox.clone());
            store = store.with_sink(sink);
        }
        let store = Arc::new(store);

        if let Some(outbox) = &outbox {
            outbox.configure(true).await;
        }
        let compaction = CompactionManager::new(Arc::clone(&adapter), self.config.compaction.clone());
        compaction.start();

        let connector = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(HttpConnector::new(
                self.config.replication.probe_timeout(),
                self.config.replication.request_timeout(),
            )),
        };
        let replication = ReplicationManager::with_emitter(
            Arc::clone(&store),
            self.config.replication.clone(),
            connector,
            Arc::clone(&self.emitter),
        );

        let running = self.running.insert(Running {
            store,
            outbox,
            compaction,
            replication,
        });

        let connected = Self::connect_remote(&self.config, &running.replication).await;
        if let Err(e) = connected {
            warn!(error = %e, "Replication setup failed, stopping sync agent");
            self.shutdown().await?;
            return Err(e);
        }

        info!("Sync agent started");
        Ok(())
    }

    async fn connect_remote(config: &TallyConfig, replication: &ReplicationManager) -> SyncResult<()> {
        let Some(remote) = config.remote_config() else {
            info!("No replication URL configured, running local-only");
            return Ok(());
        };

        match replication.configure(remote).await? {
            SyncState::Idle => replication.start_replication(),
            state => {
                warn!(state = %state, "Remote not reachable, replication not started");
                Ok(())
            }
        }
    }

    fn relay(&self) -> SyncResult<Arc<dyn EventRelay>> {
        if let Some(relay) = &self.relay {
            return Ok(Arc::clone(relay));
        }
        let endpoint = self
            .config
            .outbox
            .endpoint
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("outbox enabled without endpoint".into()))?;
        let relay = HttpRelay::new(
            endpoint,
            self.config.replication.username.clone(),
            self.config.replication.password.clone(),
        )?;
        Ok(Arc::new(relay))
    }

    /// Stops every background service. The store stays readable until drop.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        info!("Shutting down sync agent");

        running.replication.shutdown().await;

        if let Some(outbox) = &running.outbox {
            let report = outbox.flush().await;
            if outbox.pending() > 0 {
                warn!(pending = outbox.pending(), dropped = report.dropped, "Outbox not empty at shutdown");
            }
            outbox.configure(false).await;
        }

        running.compaction.stop().await;

        info!("Sync agent stopped");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for a [`SyncAgent`] with injected collaborators.
pub struct SyncAgentBuilder {
    config: TallyConfig,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    connector: Option<Arc<dyn ReplicaConnector>>,
    relay: Option<Arc<dyn EventRelay>>,
}

impl SyncAgentBuilder {
    pub fn new(config: TallyConfig) -> Self {
        SyncAgentBuilder {
            config,
            emitter: None,
            connector: None,
            relay: None,
        }
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Replaces the HTTP connector (e.g. with a `MemoryReplica`).
    pub fn with_connector(mut self, connector: Arc<dyn ReplicaConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replaces the HTTP relay used by the outbox.
    pub fn with_relay(mut self, relay: Arc<dyn EventRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn build(self) -> SyncAgent {
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let mut agent = SyncAgent::with_emitter(self.config, emitter);
        agent.connector = self.connector;
        agent.relay = self.relay;
        agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tally_core::{AggregateRef, AppendOptions, Event, StorageEngine};

    use crate::remote::MemoryReplica;

    #[derive(Default)]
    struct CollectingRelay {
        ids: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventRelay for CollectingRelay {
        async fn relay(&self, event: &Event) -> SyncResult<()> {
            self.ids.lock().push(event.id.clone());
            Ok(())
        }
    }

    fn local_config() -> TallyConfig {
        let mut config = TallyConfig::default();
        config.store.engine = StorageEngine::KeyValue;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_only_agent() {
        let mut agent = SyncAgent::new(local_config());
        assert!(agent.store().is_none());
        assert_eq!(agent.status().state, SyncState::Idle);

        agent.start().await.unwrap();
        agent.start().await.unwrap();
        assert!(agent.compaction().unwrap().is_started());
        assert!(agent.outbox().is_none());
        assert!(!agent.replication().unwrap().is_configured());

        let store = agent.store().unwrap();
        let outcome = store
            .append("shift.started", json!({ "till": 2 }), AppendOptions::new())
            .await
            .unwrap();
        assert!(outcome.is_new);

        agent.shutdown().await.unwrap();
        assert!(!agent.is_started());
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_replicates_to_configured_remote() {
        let mut config = local_config();
        config.replication.base_url = Some("http://sync.invalid".into());

        let remote = MemoryReplica::new("main");
        let mut agent = SyncAgentBuilder::new(config)
            .with_connector(Arc::new(remote.clone()))
            .build();
        agent.start().await.unwrap();
        assert!(agent.status().state.is_replicating());
        assert_eq!(agent.status().remote_db.as_deref(), Some("memory://main"));

        let store = agent.store().unwrap();
        store
            .append("sale.recorded", json!({ "total": 9.5 }), AppendOptions::new().with_key("s-1"))
            .await
            .unwrap();

        for _ in 0..50 {
            if remote.get("s-1").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(remote.get("s-1").unwrap().event.payload, json!({ "total": 9.5 }));

        agent.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_remote_does_not_fail_start() {
        let mut config = local_config();
        config.replication.base_url = Some("http://sync.invalid".into());

        let remote = MemoryReplica::new("main");
        remote.set_reachable(false);
        let mut agent = SyncAgentBuilder::new(config)
            .with_connector(Arc::new(remote))
            .build();

        agent.start().await.unwrap();
        assert_eq!(agent.status().state, SyncState::Error);
        agent.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_wired_as_store_sink() {
        let mut config = local_config();
        config.outbox.enabled = true;
        config.outbox.endpoint = Some("http://relay.invalid/events".into());

        let relay = Arc::new(CollectingRelay::default());
        let mut agent = SyncAgentBuilder::new(config)
            .with_relay(relay.clone())
            .build();
        agent.start().await.unwrap();
        assert!(agent.outbox().unwrap().is_running());

        let outcome = agent
            .store()
            .unwrap()
            .append(
                "transfer.completed",
                json!({ "qty": 1 }),
                AppendOptions::new().with_aggregate(AggregateRef::new("t-4", "transfer")),
            )
            .await
            .unwrap();

        // Shutdown flushes whatever the loop has not relayed yet.
        agent.shutdown().await.unwrap();
        assert_eq!(*relay.ids.lock(), vec![outcome.id]);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = local_config();
        config.outbox.enabled = true;

        let mut agent = SyncAgent::new(config);
        let err = agent.start().await.unwrap_err();
        assert!(err.is_config_error());
        assert!(!agent.is_started());
    }

    #[tokio::test]
    async fn test_failed_store_open_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_config();
        config.store.data_dir = Some(dir.path().to_path_buf());
        config.outbox.enabled = true;
        config.outbox.endpoint = Some("http://relay.invalid/events".into());

        // The backend opens, but the unreadable document fails the store.
        let name = config.store.store_name();
        let kv_dir = dir.path().join(format!("{}_kv", name));
        std::fs::create_dir_all(&kv_dir).unwrap();
        std::fs::write(kv_dir.join(format!("{}_broken", name)), "not json").unwrap();

        let relay = Arc::new(CollectingRelay::default());
        let mut agent = SyncAgentBuilder::new(config)
            .with_relay(relay.clone())
            .build();
        assert!(agent.start().await.is_err());
        assert!(!agent.is_started());

        // No outbox loop outlives the agent.
        drop(agent);
        tokio::task::yield_now().await;
        assert_eq!(Arc::strong_count(&relay), 1);
    }
}
