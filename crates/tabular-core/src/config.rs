//! Configuration module for Tabular
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all optional values.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TabularError};

/// Main configuration structure for Tabular
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Query execution configuration
    pub query: QueryConfig,

    /// Result cache configuration
    pub cache: CacheConfig,

    /// Materialization cache configuration
    pub materialization: MaterializationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Resource inventory
    pub resources: Vec<ResourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TabularError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| TabularError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize back to TOML, for `--dump-config`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TabularError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.query.timeout_ms == 0 {
            return Err(TabularError::Config(
                "query.timeout_ms cannot be 0".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(TabularError::Config("cache.ttl_secs cannot be 0".to_string()));
        }
        if self.cache.timeout_ms == 0 {
            return Err(TabularError::Config(
                "cache.timeout_ms cannot be 0".to_string(),
            ));
        }
        if self.cache.backend == CacheBackendKind::Redis && self.cache.redis_url.is_empty() {
            return Err(TabularError::Config(
                "cache.backend is redis but cache.redis_url is empty".to_string(),
            ));
        }
        if self.cache.namespace.is_empty() || self.cache.namespace.contains(char::is_whitespace) {
            return Err(TabularError::Config(format!(
                "Invalid cache namespace: {:?}",
                self.cache.namespace
            )));
        }

        let mat = &self.materialization;
        if mat.root.as_os_str().is_empty() {
            return Err(TabularError::Config(
                "materialization.root cannot be empty".to_string(),
            ));
        }
        if mat.transfer == TransferKind::Simulated && mat.transfer_rate_bytes_per_sec == 0 {
            return Err(TabularError::Config(
                "materialization.transfer_rate_bytes_per_sec cannot be 0".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(TabularError::Config(format!(
                    "Invalid log level: {}. Expected: trace, debug, info, warn, error",
                    other
                )));
            }
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            resource.validate()?;
            if !seen.insert(resource.id.as_str()) {
                return Err(TabularError::Config(format!(
                    "Duplicate resource id: {}",
                    resource.id
                )));
            }
        }

        Ok(())
    }
}

/// Query execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Per-query execution timeout in milliseconds
    pub timeout_ms: u64,

    /// Create supporting indices on first read of a table
    pub index_on_read: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            index_on_read: true,
        }
    }
}

impl QueryConfig {
    /// Per-query timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result cache backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Shared Redis instance
    #[default]
    Redis,

    /// In-process map
    Memory,

    /// No result caching
    Disabled,
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend to use
    pub backend: CacheBackendKind,

    /// Redis connection URL
    pub redis_url: String,

    /// Key namespace prefix
    pub namespace: String,

    /// Entry time-to-live in seconds
    pub ttl_secs: u64,

    /// Bound on each cache round trip in milliseconds
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "tabular".to_string(),
            ttl_secs: 3600,
            timeout_ms: 250,
        }
    }
}

impl CacheConfig {
    /// In-process cache with default TTL
    pub fn memory() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            ..Default::default()
        }
    }

    /// No caching
    pub fn disabled() -> Self {
        Self {
            backend: CacheBackendKind::Disabled,
            ..Default::default()
        }
    }

    /// Set TTL
    pub fn with_ttl(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    /// Entry TTL
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Round-trip timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How local copies are populated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    /// Plain local file copy
    #[default]
    Copy,

    /// Local copy paced to a nominal transfer rate
    Simulated,
}

/// Materialization cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializationConfig {
    /// Directory holding local copies
    pub root: PathBuf,

    /// Entries untouched for longer than this are evicted
    pub retention_secs: u64,

    /// Interval between background sweeps; 0 disables periodic sweeps
    pub sweep_interval_secs: u64,

    /// Run a sweep once at startup
    pub sweep_on_startup: bool,

    /// Transfer implementation
    pub transfer: TransferKind,

    /// Nominal rate for simulated transfers
    pub transfer_rate_bytes_per_sec: u64,

    /// Minimum visible duration of a simulated transfer
    pub min_transfer_ms: u64,

    /// Source used for an empty resource id and for unknown ids
    pub fallback_source: Option<PathBuf>,
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("scratch/tabular_cache"),
            retention_secs: 86_400, // 1 day
            sweep_interval_secs: 3600,
            sweep_on_startup: true,
            transfer: TransferKind::Copy,
            transfer_rate_bytes_per_sec: 50 * 1024 * 1024,
            min_transfer_ms: 500,
            fallback_source: None,
        }
    }
}

impl MaterializationConfig {
    /// Retention window
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Sweep interval, if periodic sweeps are enabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Minimum simulated transfer duration
    pub fn min_transfer(&self) -> Duration {
        Duration::from_millis(self.min_transfer_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

/// One entry of the resource inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Resource identifier, e.g. `76990/7/2`
    pub id: String,

    /// Canonical SQLite file for this resource
    pub path: Option<PathBuf>,

    /// Remote location; registered but not fetchable yet
    pub remote: Option<String>,

    /// Free-form description
    pub description: Option<String>,

    /// Known table names, if the inventory supplies them
    pub tables: Option<Vec<String>>,
}

impl ResourceConfig {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TabularError::Config("Resource id cannot be empty".to_string()));
        }
        match (&self.path, &self.remote) {
            (Some(_), Some(_)) => Err(TabularError::Config(format!(
                "Resource {} sets both path and remote",
                self.id
            ))),
            (None, None) => Err(TabularError::Config(format!(
                "Resource {} needs a path or a remote",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}
