//! CMDB configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CmdbError, Result};
use crate::watch::DEFAULT_WATCH_CHAN_SIZE;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmdbConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl CmdbConfig {
    /// Load config from the default path (~/.cmdb/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CmdbError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CmdbError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CmdbError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CMDB home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cmdb")
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cron expression, shorthand (`@daily`) or interval (`@every 30m`).
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Re-poll delay while the schedule has no defined next activation.
    #[serde(default = "default_revalidate_secs")]
    pub revalidate_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,
    #[serde(default = "default_discovery_backoff_ms")]
    pub discovery_backoff_ms: u64,
}

fn default_schedule() -> String { "@hourly".into() }
fn default_revalidate_secs() -> u64 { 60 }
fn default_max_in_flight() -> usize { 64 }
fn default_drain_timeout_secs() -> u64 { 5 }
fn default_discovery_attempts() -> u32 { 5 }
fn default_discovery_backoff_ms() -> u64 { 200 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            revalidate_secs: default_revalidate_secs(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout_secs(),
            discovery_attempts: default_discovery_attempts(),
            discovery_backoff_ms: default_discovery_backoff_ms(),
        }
    }
}

/// Executor pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_count")]
    pub count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_executor_count() -> usize { 4 }
fn default_queue_capacity() -> usize { 32 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            count: default_executor_count(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Storage adapter selection with its nested connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory {
        #[serde(default = "default_watch_chan_size")]
        watch_channel_size: usize,
    },
}

fn default_watch_chan_size() -> usize { DEFAULT_WATCH_CHAN_SIZE }

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            watch_channel_size: default_watch_chan_size(),
        }
    }
}
