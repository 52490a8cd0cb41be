//! # tally-sync: Replication and Relay for the Tally Event Log
//!
//! Everything that talks to the network: bidirectional replication with a
//! remote replica, the outbox relay, configuration, and the agent that
//! wires them around one event store.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   SyncAgent (Main Orchestrator)                  │  │
//! │  │                                                                  │  │
//! │  │  Built from TallyConfig, owned by the caller                    │  │
//! │  │  start() / shutdown()                                            │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ Outbox         │  │ Replication    │  │ CompactionManager      │    │
//! │  │                │  │ Manager        │  │ (tally-db)             │    │
//! │  │ FIFO of new    │  │                │  │                        │    │
//! │  │ events, relay  │  │ push + pull    │  │ thresholds, cooldown,  │    │
//! │  │ with retries   │  │ live loops     │  │ bounded retries        │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          ▼                   ▼                                          │
//! │  ┌────────────────┐  ┌────────────────────────────────────────────┐    │
//! │  │ EventRelay     │  │ RemoteReplica                              │    │
//! │  │ HttpRelay      │  │ HttpReplica (_changes/_bulk_docs)          │    │
//! │  └────────────────┘  │ MemoryReplica (in-process)                 │    │
//! │                      └────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  STATUS: watch::Receiver<SyncState> + SyncEventEmitter observer         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent` orchestrator and builder
//! - [`config`] - `TallyConfig` (TOML + environment)
//! - [`error`] - Sync error types
//! - [`outbox`] - Buffered relay of new events
//! - [`relay`] - Relay trait and HTTP relay
//! - [`remote`] - Remote replica trait, HTTP and in-memory replicas
//! - [`replication`] - Replication manager and state machine
//! - [`status`] - States, status snapshot, emitter trait
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{SyncAgent, TallyConfig};
//!
//! let config = TallyConfig::load_or_default(None);
//! let mut agent = SyncAgent::new(config);
//! agent.start().await?;
//!
//! let store = agent.store().expect("started");
//! store.append("sale.recorded", payload, options).await?;
//!
//! println!("Replication: {}", agent.status().state);
//! agent.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
mod direction;
pub mod error;
pub mod outbox;
pub mod relay;
pub mod remote;
pub mod replication;
pub mod status;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{SyncAgent, SyncAgentBuilder};
pub use config::TallyConfig;
pub use direction::checkpoint_key;
pub use error::{SyncError, SyncResult};
pub use outbox::{DrainReport, Outbox};
pub use relay::{EventRelay, HttpRelay};
pub use remote::{
    BulkReport, ChangesBatch, DeniedDoc, HttpConnector, HttpReplica, MemoryReplica, RemoteConfig,
    RemoteReplica, ReplicaConnector,
};
pub use replication::ReplicationManager;
pub use status::{
    Direction, DirectionEvent, DirectionState, NoOpEmitter, SyncEventEmitter, SyncState,
    SyncStatus,
};
