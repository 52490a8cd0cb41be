//! # Tally Configuration
//!
//! One file for the whole local-first stack.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_REPLICATION_URL=https://sync.example.com                     │
//! │     TALLY_BRANCH_ID=downtown                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/pos/tally.toml (Linux)                                   │
//! │     ~/Library/Application Support/com.tally.pos/tally.toml (macOS)     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     in-memory store, replication and outbox off                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [store]
//! name_prefix = "tally"
//! engine = "auto"          # auto | sqlite | key_value
//! data_dir = "/var/lib/tally"
//!
//! [replication]
//! base_url = "https://sync.example.com"
//! username = "register-1"
//! password = "secret"
//! branch_id = "downtown"
//!
//! [outbox]
//! enabled = true
//! endpoint = "https://hooks.example.com/events"
//!
//! [compaction]
//! threshold_mb = 50
//! interval_secs = 1800
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tally_core::validation::validate_store_name;
use tally_core::{CompactionSettings, OutboxSettings, ReplicationSettings, StoreSettings};

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteConfig;

/// Complete configuration: storage, replication, relay and maintenance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub replication: ReplicationSettings,

    #[serde(default)]
    pub outbox: OutboxSettings,

    #[serde(default)]
    pub compaction: CompactionSettings,
}

impl TallyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tally.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tally config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tally config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Tally config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        validate_store_name(&self.store.store_name())
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        if let Some(url) = &self.replication.base_url {
            RemoteConfig::new(url.as_str(), self.remote_database()).validate()?;
        }

        if self.replication.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "replication.batch_size must be greater than 0".into(),
            ));
        }

        if self.replication.branch_id.is_empty() {
            return Err(SyncError::InvalidConfig(
                "replication.branch_id must not be empty".into(),
            ));
        }

        if self.replication.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "replication.request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.outbox.enabled && self.outbox.endpoint.is_none() {
            return Err(SyncError::InvalidConfig(
                "outbox.endpoint is required when the outbox is enabled".into(),
            ));
        }

        if self.compaction.interval_secs == 0 || self.compaction.fast_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "compaction intervals must be greater than 0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.compaction.fragmentation_threshold) {
            return Err(SyncError::InvalidConfig(
                "compaction.fragmentation_threshold must be between 0 and 1".into(),
            ));
        }

        Ok(())
    }

    /// Applies `TALLY_*` overrides read through `lookup`.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TALLY_REPLICATION_URL") {
            debug!(url = %url, "Overriding replication URL from environment");
            self.replication.base_url = Some(url);
        }

        if let Some(prefix) = lookup("TALLY_STORE_PREFIX") {
            self.store.name_prefix = prefix;
        }

        if let Some(username) = lookup("TALLY_REMOTE_USERNAME") {
            self.replication.username = Some(username);
        }

        if let Some(password) = lookup("TALLY_REMOTE_PASSWORD") {
            self.replication.password = Some(password);
        }

        if let Some(branch) = lookup("TALLY_BRANCH_ID") {
            self.replication.branch_id = branch;
        }

        if let Some(enabled) = lookup("TALLY_OUTBOX_ENABLED") {
            match enabled.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.outbox.enabled = true,
                "0" | "false" | "no" | "off" => self.outbox.enabled = false,
                _ => warn!(value = %enabled, "Unknown TALLY_OUTBOX_ENABLED value"),
            }
        }

        if let Some(endpoint) = lookup("TALLY_OUTBOX_ENDPOINT") {
            self.outbox.endpoint = Some(endpoint);
        }

        if let Some(threshold) = lookup("TALLY_COMPACTION_THRESHOLD_MB") {
            if let Ok(mb) = threshold.parse::<u64>() {
                self.compaction.threshold_mb = mb;
            }
        }

        if let Some(interval) = lookup("TALLY_COMPACTION_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.compaction.interval_secs = secs;
                self.compaction.fast_interval_secs = self.compaction.fast_interval_secs.min(secs);
            }
        }

        if let Some(engine) = lookup("TALLY_STORE_ENGINE") {
            match engine.parse() {
                Ok(parsed) => {
                    debug!(engine = %engine, "Overriding storage engine from environment");
                    self.store.engine = parsed;
                }
                Err(_) => warn!(engine = %engine, "Unknown storage engine in environment"),
            }
        }

        if let Some(dir) = lookup("TALLY_DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("tally.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Remote database for this store and branch.
    pub fn remote_database(&self) -> String {
        self.replication.remote_database(&self.store.name_prefix)
    }

    /// Remote replica settings, when a base URL is configured.
    pub fn remote_config(&self) -> Option<RemoteConfig> {
        let url = self.replication.base_url.as_deref()?;
        let mut remote = RemoteConfig::new(url, self.remote_database());
        if let Some(username) = &self.replication.username {
            remote = remote.with_credentials(
                username.as_str(),
                self.replication.password.clone().unwrap_or_default(),
            );
        }
        Some(remote)
    }

    pub fn is_replication_configured(&self) -> bool {
        self.replication.base_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tally_core::StorageEngine;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_replication_configured());
        assert!(config.remote_config().is_none());
        assert_eq!(config.remote_database(), "tally_events_main");
        assert!(!config.outbox.enabled);
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("TALLY_REPLICATION_URL", "https://sync.example.com"),
            ("TALLY_STORE_PREFIX", "Shop"),
            ("TALLY_REMOTE_USERNAME", "register-1"),
            ("TALLY_REMOTE_PASSWORD", "secret"),
            ("TALLY_BRANCH_ID", "Downtown"),
            ("TALLY_OUTBOX_ENABLED", "true"),
            ("TALLY_OUTBOX_ENDPOINT", "https://hooks.example.com/events"),
            ("TALLY_COMPACTION_THRESHOLD_MB", "120"),
            ("TALLY_STORE_ENGINE", "kv"),
            ("TALLY_DATA_DIR", "/tmp/tally"),
        ]);

        let mut config = TallyConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());

        assert!(config.validate().is_ok());
        assert_eq!(config.remote_database(), "shop_events_downtown");
        assert_eq!(config.store.engine, StorageEngine::KeyValue);
        assert_eq!(config.store.data_dir, Some(PathBuf::from("/tmp/tally")));
        assert_eq!(config.compaction.threshold_mb, 120);
        assert!(config.outbox.enabled);

        let remote = config.remote_config().unwrap();
        assert_eq!(remote.url, "https://sync.example.com");
        assert_eq!(remote.database, "shop_events_downtown");
        assert_eq!(remote.username.as_deref(), Some("register-1"));
        assert_eq!(remote.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let vars = env(&[
            ("TALLY_COMPACTION_THRESHOLD_MB", "lots"),
            ("TALLY_STORE_ENGINE", "oracle"),
            ("TALLY_OUTBOX_ENABLED", "maybe"),
        ]);

        let mut config = TallyConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        assert_eq!(config, TallyConfig::default());
    }

    #[test]
    fn test_interval_override_caps_fast_interval() {
        let vars = env(&[("TALLY_COMPACTION_INTERVAL_SECS", "60")]);
        let mut config = TallyConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());

        assert_eq!(config.compaction.interval_secs, 60);
        assert_eq!(config.compaction.fast_interval_secs, 60);
    }

    #[test]
    fn test_validation() {
        let mut config = TallyConfig::default();

        config.replication.base_url = Some("ftp://sync.example.com".into());
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.replication.base_url = Some("https://sync.example.com".into());
        assert!(config.validate().is_ok());

        config.replication.batch_size = 0;
        assert!(config.validate().unwrap_err().is_config_error());
        config.replication.batch_size = 100;

        config.replication.request_timeout_secs = 0;
        assert!(config.validate().unwrap_err().is_config_error());
        config.replication.request_timeout_secs = 30;

        config.outbox.enabled = true;
        assert!(config.validate().is_err());
        config.outbox.endpoint = Some("https://hooks.example.com".into());
        assert!(config.validate().is_ok());

        config.store.name_prefix = "9lives".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_compaction_interval_is_rejected() {
        let mut config = TallyConfig::default();
        config.apply_overrides(|key| {
            (key == "TALLY_COMPACTION_INTERVAL_SECS").then(|| "0".to_string())
        });
        assert_eq!(config.compaction.fast_interval_secs, 0);

        let err = config.validate().unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
        assert!(err.is_config_error());

        let mut config = TallyConfig::default();
        config.compaction.fast_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tally.toml");

        let mut config = TallyConfig::default();
        config.replication.base_url = Some("http://localhost:5984".into());
        config.replication.branch_id = "north".into();
        config.compaction.threshold_mb = 10;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[replication]"));
        assert!(contents.contains("[compaction]"));

        let loaded: TallyConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: TallyConfig = toml::from_str(
            r#"
            [replication]
            base_url = "http://localhost:5984"
            "#,
        )
        .unwrap();

        assert_eq!(config.replication.branch_id, "main");
        assert_eq!(config.replication.max_backoff_secs, 30);
        assert_eq!(config.compaction.min_cooldown_secs, 3600);
        assert_eq!(config.store.name_prefix, "tally");
    }

    #[test]
    fn test_load_or_default_survives_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[store\nname_prefix = ").unwrap();

        assert!(TallyConfig::load(Some(path.clone())).is_err());
        let config = TallyConfig::load_or_default(Some(path));
        assert_eq!(config.store.name_prefix, "tally");
    }
}
