//! Configuration for the offline sync subsystem
//!
//! Settings are read from a TOML file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::{CanvasHistory, DEFAULT_HISTORY_CAPACITY};
use crate::queue::DEFAULT_QUEUE_RECORD;
use crate::retry::{RetryPolicy, DEFAULT_MAX_BACKOFF_MS, DEFAULT_MAX_RETRIES, DEFAULT_MIN_BACKOFF_MS};
use crate::scheduler::SchedulerSettings;

/// Default record name for the key seed
pub const DEFAULT_KEY_RECORD: &str = "queue_key";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("min_backoff_ms must be greater than zero")]
    ZeroMinBackoff,

    #[error("min_backoff_ms ({min}) exceeds max_backoff_ms ({max})")]
    BackoffRange { min: u64, max: u64 },

    #[error("delivery_timeout_ms must be greater than zero")]
    ZeroTimeout,

    #[error("retry_interval_ms must be greater than zero")]
    ZeroRetryInterval,

    #[error("history_capacity must be greater than zero")]
    ZeroHistoryCapacity,
}

/// Sync settings loaded from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Base URL of the signing API (default: `http://localhost:3000`)
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Directory holding the queue and key records (default: `.docsign-offline`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Record name of the encrypted queue (default: `offline_queue`)
    #[serde(default = "default_queue_record")]
    pub queue_record: String,
    /// Record name of the key seed (default: `queue_key`)
    #[serde(default = "default_key_record")]
    pub key_record: String,
    /// Failed attempts before an item is dropped (default: 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay (default: 1000)
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    /// Backoff cap (default: 30000)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Period of the background sync cycle (default: 30000)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Upper bound on a single delivery attempt (default: 15000)
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Session lifetime; sessions never expire when unset
    #[serde(default)]
    pub session_ttl_ms: Option<i64>,
    /// Undo snapshots kept per canvas (default: 20)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_api_base() -> String {
    "http://localhost:3000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".docsign-offline")
}

fn default_queue_record() -> String {
    DEFAULT_QUEUE_RECORD.to_string()
}

fn default_key_record() -> String {
    DEFAULT_KEY_RECORD.to_string()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_min_backoff_ms() -> u64 {
    DEFAULT_MIN_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_retry_interval_ms() -> u64 {
    30_000
}

fn default_delivery_timeout_ms() -> u64 {
    15_000
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            data_dir: default_data_dir(),
            queue_record: default_queue_record(),
            key_record: default_key_record(),
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            session_ttl_ms: None,
            history_capacity: default_history_capacity(),
        }
    }
}

impl SyncConfig {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the TOML is malformed,
    /// or the values fail [`SyncConfig::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_backoff_ms == 0 {
            return Err(ConfigError::ZeroMinBackoff);
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::BackoffRange {
                min: self.min_backoff_ms,
                max: self.max_backoff_ms,
            });
        }
        if self.delivery_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::ZeroRetryInterval);
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroHistoryCapacity);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_backoff_ms: self.min_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    /// An empty undo history sized by `history_capacity`
    pub fn canvas_history(&self) -> CanvasHistory {
        CanvasHistory::new(self.history_capacity)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            policy: self.retry_policy(),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            initially_online: true,
        }
    }
}
