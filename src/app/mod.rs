pub mod config;
pub mod logging_system;
pub mod relay;

pub use config::{Config, ConfigError, LogFormat, LogLevel};
pub use logging_system::{LoggingError, setup_logging};
pub use relay::{Relay, RelayError};

use anyhow::Context;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::domain::GlobalMetrics;

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!(error = %e, "Failed to listen for SIGINT");
                        }
                        info!("Received SIGINT, initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only SIGINT stops the relay");
            }
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
    }
}

fn log_global_metrics(global: &GlobalMetrics) {
    info!(
        active_sources = global.active_sources,
        total_sources = global.total_sources,
        eps = format_args!("{:.1}", global.total_realtime_eps),
        gbps = format_args!("{:.6}", global.total_realtime_gbps),
        hourly_avg_logs = format_args!("{:.1}", global.total_hourly_avg_logs),
        daily_avg_logs = format_args!("{:.1}", global.total_daily_avg_logs),
        total_logs = global.total_logs_ingested,
        "Relay metrics"
    );
}

/// Starts every configured source and runs until a shutdown signal.
///
/// A source that fails to start is logged and skipped; the others keep
/// running.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let sources = config.load_sources().with_context(|| {
        format!(
            "failed to load sources from {}",
            config.sources_file.display()
        )
    })?;

    let relay = Relay::new(config.pipeline_settings());
    let mut started = 0usize;
    for source in sources {
        let name = source.name.clone();
        match relay.add_source(source).await {
            Ok(()) => started += 1,
            Err(e) => error!(source = %name, error = %e, kind = ?e.kind(), "Failed to start source"),
        }
    }
    info!(
        started,
        listeners = relay.listeners().len(),
        "rask-syslog-relay is running. Press Ctrl+C to stop."
    );

    let mut summary = tokio::time::interval(config.metrics_log_interval);
    summary.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    summary.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = summary.tick() => log_global_metrics(&relay.global_metrics().await),
        }
    }

    relay.shutdown().await;
    log_global_metrics(&relay.global_metrics().await);
    info!("rask-syslog-relay stopped.");
    Ok(())
}

pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_env_args().context("invalid configuration")?;
    setup_logging(config.log_level, config.log_format).context("failed to initialize logging")?;

    info!(version = %get_version(), "Starting rask-syslog-relay");
    info!(
        sources_file = %config.sources_file.display(),
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval_ms,
        retry_max_attempts = config.retry_max_attempts,
        dead_letter_dir = ?config.dead_letter_dir,
        "Configuration loaded"
    );

    run(config).await
}
