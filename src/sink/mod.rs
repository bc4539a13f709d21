pub mod hec;
pub mod probe;
pub mod serialization;
pub mod storage;

pub use hec::HecSink;
pub use probe::{DestinationProbe, TestDestinationRequest, TestDestinationResponse};
pub use storage::StorageSink;

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{Batch, DestinationKind, ErrorKind};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Invalid destination configuration: {0}")]
    InvalidConfiguration(String),
    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl SinkError {
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SinkError::Timeout(hec::HEC_BATCH_TIMEOUT)
        } else {
            SinkError::NetworkError(error)
        }
    }

    /// Whether sending the same batch again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SinkError::InvalidConfiguration(_) | SinkError::SerializationError(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::InvalidConfiguration(_) => ErrorKind::Configuration,
            SinkError::SerializationError(_) => ErrorKind::Parse,
            _ => ErrorKind::TransientDelivery,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub events: usize,
    pub bytes: usize,
    /// Response status for HTTP destinations.
    pub status: Option<u16>,
}

/// A destination that accepts whole batches.
///
/// Each sink is owned by exactly one dispatcher worker; calls never overlap.
pub trait Sink: Send + 'static {
    fn kind(&self) -> &'static str;

    fn deliver(
        &mut self,
        batch: &Batch,
    ) -> impl Future<Output = Result<DeliveryReceipt, SinkError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(Debug)]
pub enum DestinationSink {
    Storage(StorageSink),
    Hec(HecSink),
}

impl DestinationSink {
    pub fn from_config(kind: &DestinationKind, source_name: &str) -> Result<Self, SinkError> {
        kind.validate()
            .map_err(|e| SinkError::InvalidConfiguration(e.to_string()))?;
        match kind {
            DestinationKind::Storage(config) => {
                Ok(DestinationSink::Storage(StorageSink::new(config, source_name)?))
            }
            DestinationKind::Hec(config) => Ok(DestinationSink::Hec(HecSink::new(config)?)),
        }
    }
}

impl Sink for DestinationSink {
    fn kind(&self) -> &'static str {
        match self {
            DestinationSink::Storage(sink) => sink.kind(),
            DestinationSink::Hec(sink) => sink.kind(),
        }
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<DeliveryReceipt, SinkError> {
        match self {
            DestinationSink::Storage(sink) => sink.deliver(batch).await,
            DestinationSink::Hec(sink) => sink.deliver(batch).await,
        }
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        match self {
            DestinationSink::Storage(sink) => sink.close().await,
            DestinationSink::Hec(sink) => sink.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HecConfig, StorageConfig};

    #[test]
    fn retryability_follows_error_kind() {
        assert!(!SinkError::InvalidConfiguration("x".into()).is_retryable());
        assert!(
            SinkError::HttpStatus {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(SinkError::Timeout(Duration::from_secs(1)).is_retryable());
        assert_eq!(
            SinkError::InvalidConfiguration("x".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn builds_sink_per_destination_type() {
        let storage = DestinationKind::Storage(StorageConfig::new("/tmp/relay-test"));
        assert_eq!(
            DestinationSink::from_config(&storage, "fw").unwrap().kind(),
            "storage"
        );

        let hec = DestinationKind::Hec(HecConfig::new("http://localhost:8088/collector", "k"));
        assert_eq!(DestinationSink::from_config(&hec, "fw").unwrap().kind(), "hec");
    }
}
