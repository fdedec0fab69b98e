//! Engine configuration.
//!
//! Configuration is loaded from a TOML file; every field has a default, so
//! an empty file (or a missing section) yields the defaults below.

use parley_core::MessagePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Listener pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Offline outbox configuration.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Message mutation rules.
    #[serde(default)]
    pub messages: MessagesConfig,
}

/// Listener pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Delay between the last detach and teardown (default: 30).
    #[serde(default = "default_teardown_grace_secs")]
    pub teardown_grace_secs: u64,
    /// Eviction sweep interval in seconds (default: 300 = 5 minutes).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Idle entries older than this are evicted by the sweep (default: 600).
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    /// Hard cap on live listeners (default: 50).
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

/// Offline outbox configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Failed attempts before an entry is parked as failed (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Entries sent concurrently per batch (default: 5).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Periodic sync interval in seconds (default: 30).
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// How long sent entries stay visible before removal (default: 2000).
    #[serde(default = "default_sent_removal_delay_ms")]
    pub sent_removal_delay_ms: u64,
    /// Local storage key holding the entry list.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

/// Message mutation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesConfig {
    /// Edit and delete-for-everyone window in seconds (default: 86400 = 24h).
    #[serde(default = "default_edit_window_secs")]
    pub edit_window_secs: u64,
    /// Maximum body length in characters (default: 10000).
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    /// Body written over messages deleted for everyone.
    #[serde(default = "default_tombstone_text")]
    pub tombstone_text: String,
}

// Default value functions
fn default_teardown_grace_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_idle_secs() -> u64 {
    600 // 10 minutes
}

fn default_max_listeners() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_batch_size() -> usize {
    5
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_sent_removal_delay_ms() -> u64 {
    2000
}

fn default_storage_key() -> String {
    "parley.outbox.pending_messages".to_string()
}

fn default_edit_window_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_body_chars() -> usize {
    10_000
}

fn default_tombstone_text() -> String {
    "This message was deleted".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            teardown_grace_secs: default_teardown_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_idle_secs: default_max_idle_secs(),
            max_listeners: default_max_listeners(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            sync_interval_secs: default_sync_interval_secs(),
            sent_removal_delay_ms: default_sent_removal_delay_ms(),
            storage_key: default_storage_key(),
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            edit_window_secs: default_edit_window_secs(),
            max_body_chars: default_max_body_chars(),
            tombstone_text: default_tombstone_text(),
        }
    }
}

impl PoolConfig {
    /// Teardown grace delay.
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_secs(self.teardown_grace_secs)
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Maximum idle age.
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl OutboxConfig {
    /// Periodic sync interval.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Delay before a sent entry is removed.
    pub fn sent_removal_delay(&self) -> Duration {
        Duration::from_millis(self.sent_removal_delay_ms)
    }
}

impl MessagesConfig {
    /// Rules handed to the mutation layer.
    pub fn policy(&self) -> MessagePolicy {
        MessagePolicy {
            edit_window_ms: (self.edit_window_secs as i64).saturating_mul(1000),
            max_body_chars: self.max_body_chars,
            tombstone_text: self.tombstone_text.clone(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            source: e,
        })
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        if self.pool.max_listeners == 0 {
            return Err(invalid("pool.max_listeners", "must be at least 1"));
        }
        if self.pool.sweep_interval_secs == 0 {
            return Err(invalid("pool.sweep_interval_secs", "must be at least 1"));
        }
        if self.outbox.batch_size == 0 {
            return Err(invalid("outbox.batch_size", "must be at least 1"));
        }
        if self.outbox.sync_interval_secs == 0 {
            return Err(invalid("outbox.sync_interval_secs", "must be at least 1"));
        }
        if self.outbox.max_retries == 0 {
            return Err(invalid("outbox.max_retries", "must be at least 1"));
        }
        if self.outbox.storage_key.trim().is_empty() {
            return Err(invalid("outbox.storage_key", "must not be empty"));
        }
        if self.messages.max_body_chars == 0 {
            return Err(invalid("messages.max_body_chars", "must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}
