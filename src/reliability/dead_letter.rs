use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::domain::{Batch, ErrorKind};
use crate::sink::serialization::{EventRecord, serialize_ndjson};

const FILE_SUFFIX: &str = ".ndjson.gz";

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Dead-letter space exceeded")]
    DiskSpaceExceeded,
}

impl DeadLetterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeadLetterError::DiskSpaceExceeded => ErrorKind::Capacity,
            _ => ErrorKind::TransientDelivery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub storage_path: PathBuf,
    pub max_disk_usage: u64,
    pub retention_period: Duration,
}

impl DeadLetterConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            max_disk_usage: 1024 * 1024 * 1024,
            retention_period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Final resting place for batches a destination could not take.
///
/// Each batch becomes one gzip'd NDJSON file named after its batch id, using
/// the same record layout as storage files so it can be replayed as-is.
#[derive(Debug)]
pub struct DeadLetterStore {
    config: DeadLetterConfig,
    current_usage: u64,
}

impl DeadLetterStore {
    pub async fn new(config: DeadLetterConfig) -> Result<Self, DeadLetterError> {
        fs::create_dir_all(&config.storage_path).await?;
        let current_usage = Self::calculate_disk_usage(&config.storage_path).await?;
        Ok(Self {
            config,
            current_usage,
        })
    }

    pub async fn store_batch(&mut self, batch: &Batch) -> Result<PathBuf, DeadLetterError> {
        let records: Vec<EventRecord<'_>> = batch.events().iter().map(EventRecord::from).collect();
        let body = serialize_ndjson(&records)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&body)?;
        let data = encoder.finish()?;

        if self.current_usage + data.len() as u64 > self.config.max_disk_usage {
            return Err(DeadLetterError::DiskSpaceExceeded);
        }

        let file_path = self.config.storage_path.join(format!(
            "{}_{}{FILE_SUFFIX}",
            batch.created_at().format("%Y%m%d_%H%M%S"),
            batch.id()
        ));
        let mut file = fs::File::create(&file_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        self.current_usage += data.len() as u64;
        tracing::debug!(
            path = %file_path.display(),
            events = batch.len(),
            bytes = data.len(),
            "Stored batch in dead-letter store"
        );
        Ok(file_path)
    }

    pub async fn list_files(&self) -> Result<Vec<PathBuf>, DeadLetterError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.config.storage_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && name.ends_with(FILE_SUFFIX)
            {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Decompressed NDJSON lines of one stored file.
    pub async fn read_file(path: &Path) -> Result<Vec<String>, DeadLetterError> {
        let data = fs::read(path).await?;
        let mut decoder = GzDecoder::new(data.as_slice());
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        Ok(text.lines().map(str::to_string).collect())
    }

    pub async fn cleanup_old_batches(&mut self) -> Result<u32, DeadLetterError> {
        let now = SystemTime::now();
        let mut deleted = 0;

        for path in self.list_files().await? {
            let metadata = fs::metadata(&path).await?;
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age > self.config.retention_period && fs::remove_file(&path).await.is_ok() {
                self.current_usage = self.current_usage.saturating_sub(metadata.len());
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!(deleted, path = %self.config.storage_path.display(), "Cleaned up expired dead-letter files");
        }
        Ok(deleted)
    }

    pub fn current_disk_usage(&self) -> u64 {
        self.current_usage
    }

    async fn calculate_disk_usage(path: &Path) -> Result<u64, DeadLetterError> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                total += entry.metadata().await?.len();
            }
        }
        Ok(total)
    }
}
