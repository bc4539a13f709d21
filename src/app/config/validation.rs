use super::{Config, ConfigError};
use std::time::Duration;

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const MAX_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        let flush = Duration::from_millis(self.flush_interval_ms);
        if !(MIN_FLUSH_INTERVAL..=MAX_FLUSH_INTERVAL).contains(&flush) {
            return Err(ConfigError::InvalidConfig(format!(
                "Flush interval must be between {}ms and {}ms, got {}ms",
                MIN_FLUSH_INTERVAL.as_millis(),
                MAX_FLUSH_INTERVAL.as_millis(),
                self.flush_interval_ms
            )));
        }

        if self.ingest_queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "Ingest queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.destination_queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "Destination queue capacity must be greater than 0".to_string(),
            ));
        }

        if self.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "Retry max attempts must be greater than 0".to_string(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "Circuit failure threshold must be greater than 0".to_string(),
            ));
        }

        if self.max_storage_events_per_file == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max storage events per file must be greater than 0".to_string(),
            ));
        }
        if self.metrics_log_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "Metrics log interval must be greater than 0".to_string(),
            ));
        }

        if let Some(dir) = &self.dead_letter_dir
            && dir.as_os_str().is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "Dead-letter directory must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
