//! TOML configuration for the Keyline daemon.
//!
//! Every section is optional. Without a config file the daemon runs with
//! [`CliConfig::default`], storing its log under `~/.keyline`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keyline_builder::{BuilderConfig, RetryPolicy};
use keyline_store::DEFAULT_SUBSCRIBER_CAPACITY;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Data location.
    pub node: NodeSection,
    /// Storage gateway backend.
    pub storage: StorageSection,
    /// Epoch sealing.
    pub epoch: EpochSection,
    /// Retry policy for gateway calls.
    pub retry: RetrySection,
    /// Update authorization.
    pub auth: AuthSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding the durable update and epoch log.
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".keyline"))
            .unwrap_or_else(|| PathBuf::from(".keyline"));
        Self { data_dir }
    }
}

/// Storage gateway implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Fjall keyspaces under `data_dir`.
    #[default]
    Fjall,
    /// In-process maps. Nothing survives a restart.
    Memory,
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Where the log is kept.
    pub backend: StorageBackend,
    /// Items buffered per subscriber before the oldest are dropped.
    pub subscriber_capacity: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fjall,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// `[epoch]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EpochSection {
    /// Seconds between periodic seals.
    pub seal_interval_secs: u64,
    /// Seal the open epoch before exiting on shutdown.
    pub seal_on_shutdown: bool,
    /// Sealed index snapshots kept in memory.
    pub retained_epochs: usize,
}

impl Default for EpochSection {
    fn default() -> Self {
        let defaults = BuilderConfig::default();
        Self {
            seal_interval_secs: defaults.seal_interval.as_secs(),
            seal_on_shutdown: true,
            retained_epochs: defaults.retained_epochs,
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts per gateway call, including the first. Zero is read as one.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff.
    pub max_backoff_ms: u64,
    /// Growth factor applied to the backoff after each retry.
    pub multiplier: f64,
    /// Deadline for a single gateway call.
    pub deadline_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = BuilderConfig::default();
        Self {
            max_attempts: defaults.retry.max_attempts,
            initial_backoff_ms: defaults.retry.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.retry.max_backoff.as_millis() as u64,
            multiplier: defaults.retry.multiplier,
            deadline_ms: defaults.storage_deadline.as_millis() as u64,
        }
    }
}

/// How submitted updates are authorized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Accept every structurally valid update.
    #[default]
    AllowAll,
    /// Require an ed25519 signature from an authorized key.
    Ed25519,
}

/// `[auth]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Authorization policy applied to every post.
    pub mode: AuthMode,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. "info", "debug", "keyline_builder=trace").
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Directory of the fjall log.
    pub fn log_dir(&self) -> PathBuf {
        self.node.data_dir.join("log")
    }

    /// Builder settings derived from the `[epoch]` and `[retry]` sections.
    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts.max(1),
                initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                multiplier: self.retry.multiplier,
            },
            storage_deadline: Duration::from_millis(self.retry.deadline_ms),
            seal_interval: Duration::from_secs(self.epoch.seal_interval_secs.max(1)),
            retained_epochs: self.epoch.retained_epochs,
        }
    }
}
