use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use super::RECEIVING_WINDOW;
use crate::buffer::QueueSender;
use crate::listener::MessageHandler;
use crate::metrics::MetricsEngine;

/// One message as read off the socket, before parsing.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub data: Bytes,
    pub peer_ip: String,
    pub received_at: DateTime<Utc>,
}

/// The non-blocking entry point of a source, registered with its listener.
///
/// Everything here is atomics plus a `try_push`; nothing waits.
#[derive(Debug)]
pub struct IngestHandle {
    name: String,
    simulation: bool,
    accepting: AtomicBool,
    queue: QueueSender<RawMessage>,
    metrics: Arc<MetricsEngine>,
    received: AtomicU64,
    received_bytes: AtomicU64,
    /// Epoch millis, 0 when nothing has arrived yet.
    last_message_ms: AtomicI64,
}

impl IngestHandle {
    pub fn new(
        name: impl Into<String>,
        simulation: bool,
        queue: QueueSender<RawMessage>,
        metrics: Arc<MetricsEngine>,
    ) -> Self {
        Self {
            name: name.into(),
            simulation,
            accepting: AtomicBool::new(true),
            queue,
            metrics,
            received: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            last_message_ms: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process_message(&self, data: &[u8], peer_ip: &str) {
        if !self.accepting.load(Ordering::Relaxed) {
            return;
        }

        let now = Utc::now();
        self.received.fetch_add(1, Ordering::Relaxed);
        self.received_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.last_message_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);

        if self.simulation {
            self.metrics.record(1, data.len() as u64);
            return;
        }

        let message = RawMessage {
            data: Bytes::copy_from_slice(data),
            peer_ip: peer_ip.to_string(),
            received_at: now,
        };
        if self.queue.try_push(message).is_err() {
            let dropped = self.queue.stats().dropped();
            // First drop and then every 1000th, so a flood does not flood the log too.
            if dropped % 1000 == 1 {
                tracing::warn!(source = %self.name, dropped, "Ingestion queue full, dropping messages");
            }
        }
    }

    /// Stops accepting; messages already queued are still processed.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.stats().dropped()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        match self.last_message_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn is_receiving_at(&self, now: DateTime<Utc>) -> bool {
        self.last_message_at().is_some_and(|last| {
            (now - last)
                .to_std()
                .map(|age| age < RECEIVING_WINDOW)
                // Clock stepped backwards: the message is newer than `now`.
                .unwrap_or(true)
        })
    }
}

impl MessageHandler for IngestHandle {
    fn handle_message(&self, data: &[u8], peer_ip: &str) {
        self.process_message(data, peer_ip);
    }
}
