use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::collect::{DataCategory, Strategy};
use crate::query::{CollectionMode, HistoricalProducer, QueryWindowProducer, RealtimeProducer};
use crate::transport::{
    TransportConfig, DEFAULT_HISTORICAL_QUEUE_CAPACITY, DEFAULT_REALTIME_QUEUE_CAPACITY,
    DEFAULT_RETRIES, DEFAULT_RETRY_DELAY,
};

/// Top-level configuration for the backhaul agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Backend connection configuration.
    pub backend: BackendConfig,

    /// Cross-poller synchronisation.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Delay between starting consecutive pollers. Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub start_stagger: Duration,

    /// Sources to poll.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Backend connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend host. Default: "127.0.0.1".
    #[serde(default = "default_host")]
    pub host: String,

    /// Backend port. Required.
    #[serde(default)]
    pub port: u16,

    /// Opt into server-driven flow control. Default: true.
    #[serde(default = "default_true")]
    pub accept_back_pressure: bool,

    /// Send retries after the first attempt. Default: 3.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Pause between send attempts. Default: 5s.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Queue capacity for historical sources. Default: 1000.
    #[serde(default = "default_historical_queue_capacity")]
    pub historical_queue_capacity: usize,

    /// Queue capacity for realtime sources. Default: 1000000.
    #[serde(default = "default_realtime_queue_capacity")]
    pub realtime_queue_capacity: usize,

    /// Optional cap on the shutdown drain.
    #[serde(default, with = "humantime_serde")]
    pub drain_timeout: Option<Duration>,
}

/// Cross-poller synchronisation.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum spread between pollers in source time. Default: 3m.
    #[serde(default = "default_sync_window", with = "humantime_serde")]
    pub window: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: "127.0.0.1:9464".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    InternalTimeSeries,
    ExternalTimeSeries,
    Notification,
    GzipFile,
}

/// One polled source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Data type reported to the backend. Defaults to the source name.
    #[serde(default)]
    pub data_type: Option<String>,

    #[serde(default)]
    pub strategy: StrategyKind,

    /// Output file for the gzip_file strategy.
    #[serde(default)]
    pub gzip_path: Option<PathBuf>,

    #[serde(default = "default_mode")]
    pub mode: CollectionMode,

    /// Realtime cadence and fetch hint. Default: 60s.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,

    /// Sent once when the poller starts.
    #[serde(default)]
    pub initial_message: Option<String>,

    #[serde(default)]
    pub update_schema_on_start: bool,

    /// Range to collect when `mode` is historical.
    #[serde(default)]
    pub historical: Option<HistoricalConfig>,

    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,

    /// Window length. Default: 1h.
    #[serde(default = "default_query_length", with = "humantime_serde")]
    pub query_length: Duration,

    /// Carry on in realtime once the range is exhausted. Default: false.
    #[serde(default)]
    pub continue_realtime: bool,
}

/// Parameters of the built-in synthetic source.
#[derive(Debug, Clone, Deserialize)]
pub struct SyntheticConfig {
    /// Default: 1.
    #[serde(default = "default_records_per_window")]
    pub records_per_window: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_historical_queue_capacity() -> usize {
    DEFAULT_HISTORICAL_QUEUE_CAPACITY
}

fn default_realtime_queue_capacity() -> usize {
    DEFAULT_REALTIME_QUEUE_CAPACITY
}

fn default_sync_window() -> Duration {
    crate::sync::DEFAULT_MAX_WINDOW
}

fn default_health_addr() -> String {
    "127.0.0.1:9464".to_string()
}

fn default_mode() -> CollectionMode {
    CollectionMode::Realtime
}

fn default_update_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_query_length() -> Duration {
    Duration::from_secs(3600)
}

fn default_records_per_window() -> usize {
    1
}

// --- Default trait impls ---

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            accept_back_pressure: true,
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            historical_queue_capacity: default_historical_queue_capacity(),
            realtime_queue_capacity: default_realtime_queue_capacity(),
            drain_timeout: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: default_sync_window(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            records_per_window: default_records_per_window(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backend: BackendConfig::default(),
            sync: SyncConfig::default(),
            health: HealthConfig::default(),
            start_stagger: Duration::ZERO,
            sources: Vec::new(),
        }
    }
}

// --- Conversions ---

impl BackendConfig {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            accept_back_pressure: self.accept_back_pressure,
            retries: self.retries,
            retry_delay: self.retry_delay,
            historical_queue_capacity: self.historical_queue_capacity,
            realtime_queue_capacity: self.realtime_queue_capacity,
            drain_timeout: self.drain_timeout,
        }
    }
}

impl SourceConfig {
    pub fn data_type(&self) -> &str {
        self.data_type.as_deref().unwrap_or(&self.name)
    }

    pub fn category(&self) -> DataCategory {
        match self.strategy {
            StrategyKind::Notification => DataCategory::Notification,
            _ => DataCategory::TimeSeries,
        }
    }

    pub fn strategy(&self) -> Result<Strategy> {
        Ok(match self.strategy {
            StrategyKind::InternalTimeSeries => Strategy::internal_time_series(),
            StrategyKind::ExternalTimeSeries => Strategy::external_time_series(),
            StrategyKind::Notification => Strategy::notification(),
            StrategyKind::GzipFile => {
                let path = self
                    .gzip_path
                    .as_ref()
                    .with_context(|| format!("source {}: gzip_path is required", self.name))?;
                Strategy::gzip_file(path)
            }
        })
    }

    pub fn producer(&self) -> Result<Box<dyn QueryWindowProducer>> {
        match self.mode {
            CollectionMode::Realtime => Ok(Box::new(RealtimeProducer::new(self.update_interval))),
            CollectionMode::Historical => {
                let h = self.historical.as_ref().with_context(|| {
                    format!("source {}: historical block is required", self.name)
                })?;
                let producer =
                    HistoricalProducer::new(h.start, h.end, h.query_length, h.continue_realtime)
                        .with_context(|| format!("source {}: invalid historical range", self.name))?;
                Ok(Box::new(producer))
            }
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.backend.host.is_empty() {
            bail!("backend.host is required");
        }

        if self.backend.port == 0 {
            bail!("backend.port is required");
        }

        if self.backend.historical_queue_capacity == 0 {
            bail!("backend.historical_queue_capacity must be positive");
        }

        if self.backend.realtime_queue_capacity == 0 {
            bail!("backend.realtime_queue_capacity must be positive");
        }

        if self.sync.window.is_zero() {
            bail!("sync.window must be positive");
        }

        if self.sources.is_empty() {
            bail!("at least one source is required");
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                bail!("source name is required");
            }

            if !names.insert(source.name.as_str()) {
                bail!("duplicate source name {}", source.name);
            }

            if source.update_interval.is_zero() {
                bail!("source {}: update_interval must be positive", source.name);
            }

            if source.strategy == StrategyKind::GzipFile && source.gzip_path.is_none() {
                bail!("source {}: gzip_path is required for gzip_file", source.name);
            }

            if source.mode == CollectionMode::Historical {
                let Some(h) = &source.historical else {
                    bail!("source {}: historical block is required", source.name);
                };

                if h.start >= h.end {
                    bail!(
                        "source {}: historical.start must be before historical.end",
                        source.name
                    );
                }

                if h.query_length.is_zero() {
                    bail!("source {}: historical.query_length must be positive", source.name);
                }
            }
        }

        Ok(())
    }
}
