//! Centralized configuration for hubshare.
//!
//! Constant groups cover shared record naming, lock names, event bus sizing and
//! the SQLite store. `SharedConnectionConfig` carries the per-instance knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Naming of records in the shared store.
pub struct StoreConfig;

impl StoreConfig {
    /// Versioned prefix; bump the version whenever a record schema changes.
    pub const DEFAULT_NAMESPACE: &'static str = "hubshare_v1_";
    pub const START_RESULT_KEY: &'static str = "start_result";
    pub const STATE_KEY: &'static str = "state";
    pub const SUBSCRIPTION_KEY_PREFIX: &'static str = "subscription/";
}

/// Names of the cross-process locks.
pub struct LockConfig;

impl LockConfig {
    pub const ELECTION_LOCK: &'static str = "election";
    pub const START_RESULT_LOCK: &'static str = "start_result";
    pub const STATE_LOCK: &'static str = "state";
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);
}

/// Event bus sizing.
pub struct BusConfig;

impl BusConfig {
    pub const BUS_KEY: &'static str = "bus";
    /// Capacity of the lifecycle event broadcast channels. Store watchers are unbounded.
    pub const CHANNEL_CAPACITY: usize = 1024;
}

/// SQLite-backed store parameters.
pub struct SqliteConfig;

impl SqliteConfig {
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
    pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
    pub const CHANGE_RETENTION: Duration = Duration::from_secs(60);
    pub const PRUNE_EVERY_POLLS: u32 = 250;
    pub const DB_FILENAME: &'static str = "shared.db";
    pub const LOCK_DIR_NAME: &'static str = "locks";
}

/// Per-instance configuration of a shared connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SharedConnectionConfig {
    /// Prefix applied to every shared record and lock name.
    pub namespace: String,
    /// Attempts for read-modify-write updates of subscription records.
    pub cas_max_attempts: u32,
    /// How often a waiting lock acquisition rechecks a held lock.
    pub lock_poll_interval: Duration,
    /// Restart the owner's connection when a channel is bound for the first time
    /// while connected.
    pub owner_restart_on_new_channels: bool,
}

impl SharedConnectionConfig {
    pub const DEFAULT_CAS_MAX_ATTEMPTS: u32 = 32;

    /// Full store key for a record name.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.namespace, name)
    }

    /// Full lock name.
    pub fn lock_name(&self, name: &str) -> String {
        format!("{}{}", self.namespace, name)
    }

    /// Store key prefix shared by all subscription records.
    pub fn subscription_prefix(&self) -> String {
        self.key(StoreConfig::SUBSCRIPTION_KEY_PREFIX)
    }

    /// Store key of one channel's subscription record.
    pub fn subscription_key(&self, channel: &str) -> String {
        format!("{}{}", self.subscription_prefix(), channel)
    }
}

impl Default for SharedConnectionConfig {
    fn default() -> Self {
        Self {
            namespace: StoreConfig::DEFAULT_NAMESPACE.to_string(),
            cas_max_attempts: Self::DEFAULT_CAS_MAX_ATTEMPTS,
            lock_poll_interval: LockConfig::DEFAULT_POLL_INTERVAL,
            owner_restart_on_new_channels: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        let config = SharedConnectionConfig::default();
        assert_eq!(config.key(StoreConfig::STATE_KEY), "hubshare_v1_state");
        assert_eq!(
            config.subscription_key("echo"),
            "hubshare_v1_subscription/echo"
        );
        assert!(config
            .subscription_key("echo")
            .starts_with(&config.subscription_prefix()));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: SharedConnectionConfig =
            serde_json::from_str(r#"{"namespace": "test_v2_"}"#).unwrap();
        assert_eq!(config.namespace, "test_v2_");
        assert_eq!(
            config.cas_max_attempts,
            SharedConnectionConfig::DEFAULT_CAS_MAX_ATTEMPTS
        );
        assert!(config.owner_restart_on_new_channels);
    }
}
