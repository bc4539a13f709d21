use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::serialization::EventRecord;
use super::{DeliveryReceipt, Sink, SinkError};
use crate::domain::{Batch, LogEvent, StorageConfig};

#[derive(Debug)]
struct OpenFile {
    file: File,
    path: PathBuf,
    events: usize,
    /// Length of the file after the last successful write.
    bytes: u64,
}

/// How much of a failed batch already reached disk, so a retry of the same
/// batch appends only the rest.
#[derive(Debug)]
struct Progress {
    batch_id: String,
    committed: usize,
}

/// Append-only NDJSON files under one directory, rotated by event count.
///
/// Owned by a single dispatcher worker, so no locking.
#[derive(Debug)]
pub struct StorageSink {
    dir: PathBuf,
    file_prefix: String,
    max_events_per_file: usize,
    current: Option<OpenFile>,
    sequence: u64,
    closed_files: Vec<PathBuf>,
    progress: Option<Progress>,
}

impl StorageSink {
    pub fn new(config: &StorageConfig, source_name: &str) -> Result<Self, SinkError> {
        if config.path.as_os_str().is_empty() {
            return Err(SinkError::InvalidConfiguration(
                "storage path is empty".to_string(),
            ));
        }
        if config.max_events_per_file == 0 {
            return Err(SinkError::InvalidConfiguration(
                "max_events_per_file must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            dir: config.path.clone(),
            file_prefix: sanitize_file_component(source_name),
            max_events_per_file: config.max_events_per_file,
            current: None,
            sequence: 0,
            closed_files: Vec::new(),
            progress: None,
        })
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.path.as_path())
    }

    /// Files that were rotated away from, oldest first.
    pub fn closed_files(&self) -> &[PathBuf] {
        &self.closed_files
    }

    async fn open_new_file(&mut self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(format!(
            "{}_{}_{:04}.json",
            self.file_prefix,
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.sequence
        ));
        self.sequence += 1;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let bytes = file.metadata().await?.len();
        tracing::debug!(path = %path.display(), "Opened storage file");

        self.current = Some(OpenFile {
            file,
            path,
            events: 0,
            bytes,
        });
        Ok(())
    }

    async fn rotate(&mut self) -> Result<(), SinkError> {
        if let Some(mut open) = self.current.take() {
            open.file.flush().await?;
            open.file.sync_data().await?;
            tracing::info!(path = %open.path.display(), events = open.events, "Rotated storage file");
            self.closed_files.push(open.path);
        }
        Ok(())
    }

    /// Writes and syncs `pending`, which holds `events` records. On failure
    /// the file is cut back to its last good length; if that fails too, the
    /// file is abandoned and the next write starts a new one.
    async fn write_pending(&mut self, pending: &mut Vec<u8>, events: usize) -> Result<(), SinkError> {
        if pending.is_empty() {
            return Ok(());
        }
        let Some(open) = self.current.as_mut() else {
            return Err(SinkError::IoError(std::io::Error::other("no storage file open")));
        };

        let written = match open.file.write_all(pending).await {
            Ok(()) => open.file.sync_data().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(rollback) = open.file.set_len(open.bytes).await {
                tracing::warn!(
                    path = %open.path.display(),
                    error = %rollback,
                    "Failed to roll back partial write, abandoning file"
                );
                if let Some(open) = self.current.take() {
                    self.closed_files.push(open.path);
                }
            }
            return Err(e.into());
        }

        open.bytes += pending.len() as u64;
        open.events += events;
        pending.clear();
        Ok(())
    }

    /// Appends `events` to the current file, rotating as files fill up.
    /// `committed` counts the events that are durably on disk.
    async fn append(&mut self, events: &[LogEvent], committed: &mut usize) -> Result<(), SinkError> {
        let mut pending = Vec::new();
        let mut pending_events = 0usize;

        for event in events {
            if self
                .current
                .as_ref()
                .is_some_and(|open| open.events + pending_events >= self.max_events_per_file)
            {
                self.write_pending(&mut pending, pending_events).await?;
                *committed += pending_events;
                pending_events = 0;
                self.rotate().await?;
            }
            if self.current.is_none() {
                self.open_new_file().await?;
            }

            serde_json::to_writer(&mut pending, &EventRecord::from(event))?;
            pending.push(b'\n');
            pending_events += 1;
        }

        self.write_pending(&mut pending, pending_events).await?;
        *committed += pending_events;
        Ok(())
    }
}

impl Sink for StorageSink {
    fn kind(&self) -> &'static str {
        "storage"
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<DeliveryReceipt, SinkError> {
        let mut committed = match self.progress.take() {
            Some(progress) if progress.batch_id == batch.id() => progress.committed,
            _ => 0,
        };
        if committed > 0 {
            tracing::debug!(batch_id = %batch.id(), committed, "Resuming partly written batch");
        }

        let events = batch.events().get(committed..).unwrap_or_default();
        if let Err(e) = self.append(events, &mut committed).await {
            if committed > 0 {
                self.progress = Some(Progress {
                    batch_id: batch.id().to_string(),
                    committed,
                });
            }
            return Err(e);
        }

        Ok(DeliveryReceipt {
            events: batch.len(),
            bytes: batch.byte_size(),
            status: None,
        })
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut open) = self.current.take() {
            open.file.flush().await?;
            open.file.sync_all().await?;
        }
        Ok(())
    }
}

fn sanitize_file_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "source".to_string()
    } else {
        cleaned
    }
}
