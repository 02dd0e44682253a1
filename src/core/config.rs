//! Configuration parsing and validation.
//!
//! Sluice configuration is loaded from TOML files with CLI overrides. There
//! is no process-global configuration: the loaded [`Config`] is passed
//! explicitly into every constructor that needs it.

use crate::model::{ChangefeedId, Ts, DEFAULT_NAMESPACE};
use crate::storage::external::parse_storage_url;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lower bound for the redo meta flush interval.
pub const MIN_FLUSH_INTERVAL_MS: u64 = 2000;

/// Top-level Sluice configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Capture server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Redo (consistent replication) configuration.
    #[serde(default)]
    pub consistent: ConsistentConfig,

    /// Scheduler knobs handed to owner/processor-manager factories.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Telemetry and logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Changefeeds this cluster replicates, declared up front.
    #[serde(default)]
    pub changefeeds: Vec<ChangefeedConfig>,
}

/// Capture server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Endpoint peers connect to. Port 0 binds an ephemeral port and the
    /// resolved address is advertised instead.
    #[serde(default = "default_advertise_addr")]
    pub advertise_addr: String,

    /// Cluster id prefixed to every coordination-store key.
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Session lease TTL in seconds.
    #[serde(default = "default_capture_session_ttl")]
    pub capture_session_ttl: u64,

    /// Owner reactor tick period in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub owner_flush_interval_ms: u64,

    /// Processor reactor tick period in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub processor_flush_interval_ms: u64,

    /// Upstream database endpoints.
    #[serde(default)]
    pub upstream_endpoints: Vec<String>,
}

/// Redo configuration. `level = "none"` disables the redo subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistentConfig {
    /// Consistency level; only `"none"` disables redo.
    #[serde(default = "default_consistent_level")]
    pub level: String,

    /// URL of the external-storage root. Schemes `nfs` and `local` are
    /// rewritten to `file`; `blackhole` keeps the component alive with all
    /// I/O degraded to no-ops.
    #[serde(default = "default_consistent_storage")]
    pub storage: String,

    /// Period of the redo meta flush loop, in milliseconds.
    #[serde(default = "default_consistent_flush_interval")]
    pub flush_interval_in_ms: u64,
}

impl ConsistentConfig {
    /// Whether the redo subsystem is enabled at all.
    pub fn is_enabled(&self) -> bool {
        self.level != "none"
    }

    /// Flush period as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_in_ms)
    }
}

impl Default for ConsistentConfig {
    fn default() -> Self {
        Self {
            level: default_consistent_level(),
            storage: default_consistent_storage(),
            flush_interval_in_ms: default_consistent_flush_interval(),
        }
    }
}

/// Scheduler knobs. Opaque to the capture; owner and processor-manager
/// factories interpret them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period between cluster re-balance checks, in milliseconds.
    #[serde(default = "default_check_balance_interval_ms")]
    pub check_balance_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_balance_interval_ms: default_check_balance_interval_ms(),
        }
    }
}

/// Telemetry and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// A changefeed declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangefeedConfig {
    /// Namespace; defaults to `"default"`.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Changefeed id.
    pub id: String,

    /// Timestamp replication starts from.
    pub start_ts: Ts,
}

impl ChangefeedConfig {
    /// The changefeed identifier for this entry.
    pub fn changefeed_id(&self) -> ChangefeedId {
        ChangefeedId::new(self.namespace.clone(), self.id.clone())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            advertise_addr: default_advertise_addr(),
            cluster_id: default_cluster_id(),
            capture_session_ttl: default_capture_session_ttl(),
            owner_flush_interval_ms: default_flush_interval_ms(),
            processor_flush_interval_ms: default_flush_interval_ms(),
            upstream_endpoints: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            consistent: ConsistentConfig::default(),
            scheduler: SchedulerConfig::default(),
            telemetry: TelemetryConfig::default(),
            changefeeds: Vec::new(),
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse a configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("failed to parse config")?;
        Ok(config)
    }

    /// Validate invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.advertise_addr.is_empty() {
            anyhow::bail!("server.advertise_addr must not be empty");
        }
        if self.server.capture_session_ttl == 0 {
            anyhow::bail!("server.capture_session_ttl must be at least 1 second");
        }
        if self.server.owner_flush_interval_ms == 0 || self.server.processor_flush_interval_ms == 0
        {
            anyhow::bail!("reactor flush intervals must be nonzero");
        }
        if self.consistent.is_enabled() {
            if self.consistent.flush_interval_in_ms < MIN_FLUSH_INTERVAL_MS {
                anyhow::bail!(
                    "consistent.flush_interval_in_ms must be at least {} (got {})",
                    MIN_FLUSH_INTERVAL_MS,
                    self.consistent.flush_interval_in_ms
                );
            }
            parse_storage_url(&self.consistent.storage)
                .with_context(|| format!("consistent.storage {:?}", self.consistent.storage))?;
        }
        for feed in &self.changefeeds {
            if feed.id.is_empty() {
                anyhow::bail!("changefeed id must not be empty");
            }
            if feed.start_ts == 0 {
                anyhow::bail!("changefeed {} start_ts must be nonzero", feed.id);
            }
        }
        Ok(())
    }

    /// Session lease TTL as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.server.capture_session_ttl)
    }

    /// Owner reactor tick period.
    pub fn owner_flush_interval(&self) -> Duration {
        Duration::from_millis(self.server.owner_flush_interval_ms)
    }

    /// Processor reactor tick period.
    pub fn processor_flush_interval(&self) -> Duration {
        Duration::from_millis(self.server.processor_flush_interval_ms)
    }
}

fn default_advertise_addr() -> String {
    "127.0.0.1:8300".to_string()
}

fn default_cluster_id() -> String {
    "default".to_string()
}

fn default_capture_session_ttl() -> u64 {
    10
}

fn default_flush_interval_ms() -> u64 {
    50
}

fn default_consistent_level() -> String {
    "none".to_string()
}

fn default_consistent_storage() -> String {
    String::new()
}

fn default_consistent_flush_interval() -> u64 {
    MIN_FLUSH_INTERVAL_MS
}

fn default_check_balance_interval_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}
