use super::groups::{SourcesFile, load_sources};
use super::{ConfigError, LogFormat, LogLevel};
use crate::buffer::BatchConfig;
use crate::dispatch::DispatchConfig;
use crate::domain::SourceConfig;
use crate::reliability::{CircuitConfig, RetryConfig};
use crate::source::PipelineSettings;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Source definitions file (TOML, or JSON by extension)
    #[arg(long, env = "RELAY_SOURCES_FILE", default_value = "sources.toml")]
    pub sources_file: PathBuf,

    /// Log level
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "RELAY_LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Maximum messages per processing batch
    #[arg(long, env = "RELAY_BATCH_SIZE", default_value = "1000")]
    pub batch_size: usize,

    /// Flush interval in milliseconds
    #[arg(long, env = "RELAY_FLUSH_INTERVAL_MS", default_value = "2000")]
    pub flush_interval_ms: u64,

    /// Raw messages buffered per source before new ones are dropped
    #[arg(long, env = "RELAY_INGEST_QUEUE_CAPACITY", default_value = "10000")]
    pub ingest_queue_capacity: usize,

    /// Batches buffered per destination before new ones are dropped
    #[arg(long, env = "RELAY_DESTINATION_QUEUE_CAPACITY", default_value = "1000")]
    pub destination_queue_capacity: usize,

    /// Delivery attempts per batch, first try included
    #[arg(long, env = "RELAY_RETRY_MAX_ATTEMPTS", default_value = "5")]
    pub retry_max_attempts: u32,

    /// Delay between delivery attempts in milliseconds
    #[arg(long, env = "RELAY_RETRY_DELAY_MS", default_value = "2000")]
    pub retry_delay_ms: u64,

    /// Consecutive failed batches that open a destination's circuit
    #[arg(long, env = "RELAY_CIRCUIT_FAILURE_THRESHOLD", default_value = "5")]
    pub circuit_failure_threshold: u32,

    /// How long an open circuit rejects deliveries, in milliseconds
    #[arg(long, env = "RELAY_CIRCUIT_OPEN_MS", default_value = "30000")]
    pub circuit_open_ms: u64,

    /// Directory for undeliverable batches; discarded when unset
    #[arg(long, env = "RELAY_DEAD_LETTER_DIR")]
    pub dead_letter_dir: Option<PathBuf>,

    /// Events per storage file when a destination does not set its own
    #[arg(long, env = "RELAY_MAX_STORAGE_EVENTS_PER_FILE", default_value = "50000")]
    pub max_storage_events_per_file: usize,

    /// Interval of the global metrics summary log, in seconds
    #[arg(long, env = "RELAY_METRICS_LOG_INTERVAL_SECS", default_value = "60")]
    pub metrics_log_interval_secs: u64,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub flush_interval: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub retry_delay: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub circuit_open_duration: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub metrics_log_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("sources.toml"),
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            batch_size: 1000,
            flush_interval_ms: 2000,
            ingest_queue_capacity: 10_000,
            destination_queue_capacity: 1000,
            retry_max_attempts: 5,
            retry_delay_ms: 2000,
            circuit_failure_threshold: 5,
            circuit_open_ms: 30_000,
            dead_letter_dir: None,
            max_storage_events_per_file: 50_000,
            metrics_log_interval_secs: 60,
            flush_interval: Duration::from_millis(2000),
            retry_delay: Duration::from_millis(2000),
            circuit_open_duration: Duration::from_millis(30_000),
            metrics_log_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::try_parse_from(args)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the process arguments; `--help`, `--version` and usage errors
    /// exit the process the way clap does.
    pub fn from_env_args() -> Result<Self, ConfigError> {
        let mut config = Config::parse();
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads process settings from a TOML file; absent keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.flush_interval = Duration::from_millis(self.flush_interval_ms);
        self.retry_delay = Duration::from_millis(self.retry_delay_ms);
        self.circuit_open_duration = Duration::from_millis(self.circuit_open_ms);
        self.metrics_log_interval = Duration::from_secs(self.metrics_log_interval_secs);
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            batch: BatchConfig {
                max_size: self.batch_size,
                max_wait_time: self.flush_interval,
            },
            ingest_queue_capacity: self.ingest_queue_capacity,
            dispatch: DispatchConfig {
                queue_capacity: self.destination_queue_capacity,
                max_batch_events: self.batch_size,
                flush_interval: self.flush_interval,
                retry: RetryConfig {
                    max_attempts: self.retry_max_attempts,
                    base_delay: self.retry_delay,
                    ..RetryConfig::default()
                },
                circuit: CircuitConfig {
                    failure_threshold: self.circuit_failure_threshold,
                    open_duration: self.circuit_open_duration,
                },
            },
            dead_letter_dir: self.dead_letter_dir.clone(),
            ..PipelineSettings::default()
        }
    }

    pub fn load_sources(&self) -> Result<Vec<SourceConfig>, ConfigError> {
        load_sources(&self.sources_file, self.max_storage_events_per_file)
            .map(|SourcesFile { sources }| sources)
    }
}
