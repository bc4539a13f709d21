pub mod ingest;
pub mod processor;
pub mod router;

pub use ingest::{IngestHandle, RawMessage};
pub use processor::LogProcessor;
pub use router::SourceRouter;

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::buffer::{BatchConfig, BufferError};
use crate::dispatch::DispatchConfig;
use crate::domain::{ConfigError, ErrorKind};
use crate::listener::ListenerError;
use crate::reliability::DeadLetterError;
use crate::sink::SinkError;

pub const DEFAULT_INGEST_QUEUE_CAPACITY: usize = 10_000;

/// A peer counts as receiving while its last message is younger than this.
pub const RECEIVING_WINDOW: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid source configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("destination '{id}': {source}")]
    Destination {
        id: String,
        #[source]
        source: SinkError,
    },
    #[error("dead-letter store for destination '{id}': {source}")]
    DeadLetter {
        id: String,
        #[source]
        source: DeadLetterError,
    },
    #[error("queue setup failed: {0}")]
    Queue(#[from] BufferError),
    #[error("source '{0}' is already running")]
    AlreadyRunning(String),
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Config(e) => e.kind(),
            SourceError::Listener(e) => e.kind(),
            SourceError::Destination { source, .. } => source.kind(),
            SourceError::Queue(e) => e.kind(),
            SourceError::DeadLetter { .. } | SourceError::AlreadyRunning(_) => {
                ErrorKind::Configuration
            }
        }
    }
}

/// Process-wide pipeline tuning shared by every source.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub batch: BatchConfig,
    pub ingest_queue_capacity: usize,
    pub dispatch: DispatchConfig,
    /// Root for dead-letter files; batches are discarded when unset.
    pub dead_letter_dir: Option<PathBuf>,
    pub tick_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            ingest_queue_capacity: DEFAULT_INGEST_QUEUE_CAPACITY,
            dispatch: DispatchConfig::default(),
            dead_letter_dir: None,
            tick_interval: Duration::from_secs(1),
        }
    }
}
