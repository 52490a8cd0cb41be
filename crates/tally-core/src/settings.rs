//! # Settings
//!
//! Configuration structs for every component, with serde defaults.
//!
//! These are plain data. Loading them from TOML and the environment is
//! done by `tally_sync::config::TallyConfig`; the components themselves
//! only ever receive an already-validated struct.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Settings Layout                                  │
//! │                                                                         │
//! │  [store]        name_prefix, engine, data_dir                           │
//! │  [replication]  base_url, username, password, branch_id, timeouts       │
//! │  [outbox]       enabled, endpoint, max_attempts, retry_delay            │
//! │  [compaction]   threshold_mb, interval, cooldown, retries, polling      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::retry::RetryPolicy;

// =============================================================================
// Store Settings
// =============================================================================

/// Which persistence engine to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageEngine {
    /// SQLite when it can be opened, key/value otherwise.
    #[default]
    Auto,
    Sqlite,
    KeyValue,
}

impl std::fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageEngine::Auto => write!(f, "auto"),
            StorageEngine::Sqlite => write!(f, "sqlite"),
            StorageEngine::KeyValue => write!(f, "key_value"),
        }
    }
}

impl std::str::FromStr for StorageEngine {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(StorageEngine::Auto),
            "sqlite" => Ok(StorageEngine::Sqlite),
            "key_value" | "kv" | "keyvalue" => Ok(StorageEngine::KeyValue),
            other => Err(ValidationError::InvalidFormat {
                field: "engine".to_string(),
                reason: format!("unknown engine '{}'", other),
            }),
        }
    }
}

/// Local store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Prefix for the store name (`<prefix>_events`) and the remote database.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default)]
    pub engine: StorageEngine,

    /// Directory for on-disk data. `None` keeps everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_name_prefix() -> String {
    "tally".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            name_prefix: default_name_prefix(),
            engine: StorageEngine::default(),
            data_dir: None,
        }
    }
}

impl StoreSettings {
    /// Local store name, e.g. `tally_events`.
    pub fn store_name(&self) -> String {
        format!("{}_events", self.name_prefix.to_lowercase())
    }
}

// =============================================================================
// Replication Settings
// =============================================================================

/// Remote replica and replication loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Remote base URL, e.g. `https://sync.example.com`. `None` disables replication.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Branch / tenant id used to namespace the remote database.
    #[serde(default = "default_branch_id")]
    pub branch_id: String,

    /// Reachability probe timeout (seconds).
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout for every other remote request (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Stabilization delay after the network comes back (seconds).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Initial backoff (milliseconds) for a failing direction.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Documents per push/pull batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle time between live polls once a direction has caught up (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_branch_id() -> String {
    "main".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        ReplicationSettings {
            base_url: None,
            username: None,
            password: None,
            branch_id: default_branch_id(),
            probe_timeout_secs: default_probe_timeout(),
            request_timeout_secs: default_request_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ReplicationSettings {
    /// Remote database name: `<prefix>_events_<branch>`, lowercased.
    pub fn remote_database(&self, prefix: &str) -> String {
        format!("{}_events_{}", prefix, self.branch_id).to_lowercase()
    }

    /// Per-direction retry schedule.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_secs(self.max_backoff_secs),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =============================================================================
// Outbox Settings
// =============================================================================

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Relay endpoint that receives `{aggregateId, aggregateType, event}`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Attempts per item before it is dropped. Never less than 2.
    #[serde(default = "default_outbox_attempts")]
    pub max_attempts: u32,

    /// Pause after a drain pass that had failures (milliseconds).
    #[serde(default = "default_outbox_retry_delay")]
    pub retry_delay_ms: u64,

    /// Idle wake-up interval of the drain loop (milliseconds).
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
}

fn default_outbox_attempts() -> u32 {
    5
}

fn default_outbox_retry_delay() -> u64 {
    1000
}

fn default_drain_interval() -> u64 {
    1000
}

impl Default for OutboxSettings {
    fn default() -> Self {
        OutboxSettings {
            enabled: false,
            endpoint: None,
            max_attempts: default_outbox_attempts(),
            retry_delay_ms: default_outbox_retry_delay(),
            drain_interval_ms: default_drain_interval(),
        }
    }
}

impl OutboxSettings {
    /// Attempt budget with the at-least-one-retry floor applied.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(2)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

// =============================================================================
// Compaction Settings
// =============================================================================

/// Storage maintenance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionSettings {
    /// Compact once total size exceeds this many megabytes.
    #[serde(default = "default_threshold_mb")]
    pub threshold_mb: u64,

    /// Tick interval on ordinary hosts (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Tick interval on hosts with 8 or more CPUs (seconds).
    #[serde(default = "default_fast_interval")]
    pub fast_interval_secs: u64,

    /// Minimum time between successful compactions (seconds).
    #[serde(default = "default_cooldown")]
    pub min_cooldown_secs: u64,

    #[serde(default = "default_fragmentation")]
    pub fragmentation_threshold: f64,

    /// Fragmentation only counts above this many live documents.
    #[serde(default = "default_min_documents")]
    pub min_documents: u64,

    /// Retries after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// How often to poll the adapter while compaction runs (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Give up polling after this long (seconds).
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_threshold_mb() -> u64 {
    50
}

fn default_interval() -> u64 {
    30 * 60
}

fn default_fast_interval() -> u64 {
    10 * 60
}

fn default_cooldown() -> u64 {
    60 * 60
}

fn default_fragmentation() -> f64 {
    0.30
}

fn default_min_documents() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    500
}

fn default_poll_timeout() -> u64 {
    300
}

impl Default for CompactionSettings {
    fn default() -> Self {
        CompactionSettings {
            threshold_mb: default_threshold_mb(),
            interval_secs: default_interval(),
            fast_interval_secs: default_fast_interval(),
            min_cooldown_secs: default_cooldown(),
            fragmentation_threshold: default_fragmentation(),
            min_documents: default_min_documents(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            poll_interval_ms: default_poll_interval(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl CompactionSettings {
    /// Tick interval for a host with `cpus` available CPUs. Never below one second.
    pub fn interval_for(&self, cpus: usize) -> Duration {
        let secs = if cpus >= 8 {
            self.fast_interval_secs
        } else {
            self.interval_secs
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_mb.saturating_mul(1024 * 1024)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.min_cooldown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// First attempt plus `max_retries` retries, fixed delay in between.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            Duration::from_secs(self.retry_delay_secs),
            self.max_retries.saturating_add(1),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml_shape() {
        let settings: CompactionSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, CompactionSettings::default());
        assert_eq!(settings.threshold_bytes(), 50 * 1024 * 1024);

        let replication: ReplicationSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(replication.branch_id, "main");
        assert_eq!(replication.reconnect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_interval_depends_on_cpus() {
        let settings = CompactionSettings::default();
        assert_eq!(settings.interval_for(4), Duration::from_secs(1800));
        assert_eq!(settings.interval_for(8), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let settings = CompactionSettings {
            interval_secs: 0,
            fast_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.interval_for(4), Duration::from_secs(1));
        assert_eq!(settings.interval_for(16), Duration::from_secs(1));
    }

    #[test]
    fn test_compaction_retry_policy_counts_first_attempt() {
        let policy = CompactionSettings::default().retry_policy();
        assert_eq!(policy.max_attempts, Some(4));
    }

    #[test]
    fn test_remote_database_name() {
        let settings = ReplicationSettings {
            branch_id: "Downtown".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.remote_database("Tally"), "tally_events_downtown");
    }

    #[test]
    fn test_outbox_attempt_floor() {
        let settings = OutboxSettings {
            max_attempts: 1,
            ..Default::default()
        };
        assert_eq!(settings.effective_max_attempts(), 2);
    }

    #[test]
    fn test_engine_parse() {
        assert_eq!("sqlite".parse::<StorageEngine>().unwrap(), StorageEngine::Sqlite);
        assert_eq!("KV".parse::<StorageEngine>().unwrap(), StorageEngine::KeyValue);
        assert!("redis".parse::<StorageEngine>().is_err());
        assert_eq!(StoreSettings::default().store_name(), "tally_events");
    }
}
