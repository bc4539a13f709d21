//! Per-destination delivery.
//!
//! Every enabled destination of a source gets its own bounded queue and a
//! worker task, so one slow or failing destination never holds up the
//! others. Batches are shared between queues as `Arc<Batch>`; a full queue
//! drops only that destination's copy.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{
    BatchCollector, BatchConfig, BufferError, DEFAULT_FLUSH_INTERVAL, QueueSender, bounded,
};
use crate::domain::{Batch, DestinationConfig, DestinationMetrics};
use crate::reliability::{CircuitBreaker, CircuitConfig, DeadLetterStore, RetryConfig, RetryPolicy};
use crate::sink::{Sink, SinkError};

pub const DEFAULT_DESTINATION_QUEUE_CAPACITY: usize = 1000;

const DEAD_LETTER_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Queued batches per destination before new ones are dropped.
    pub queue_capacity: usize,
    /// Upper bound on events merged into one delivery.
    pub max_batch_events: usize,
    /// How long a delivery waits for more batches once the first arrives.
    pub flush_interval: Duration,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_DESTINATION_QUEUE_CAPACITY,
            max_batch_events: 1000,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    /// Epoch millis of the last successful delivery, 0 when none.
    last_delivery_ms: AtomicI64,
}

impl DeliveryStats {
    fn last_delivery_at(&self) -> Option<DateTime<Utc>> {
        match self.last_delivery_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

#[derive(Debug)]
pub struct DestinationDispatcher {
    id: String,
    name: String,
    kind: &'static str,
    sender: QueueSender<Arc<Batch>>,
    stats: Arc<DeliveryStats>,
    circuit: Arc<CircuitBreaker>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DestinationDispatcher {
    /// Starts the worker for one destination. Must be called from within a
    /// tokio runtime.
    pub fn spawn<S: Sink>(
        destination: &DestinationConfig,
        source_name: &str,
        sink: S,
        dead_letter: Option<DeadLetterStore>,
        config: &DispatchConfig,
    ) -> Result<Self, BufferError> {
        let (sender, receiver) = bounded(config.queue_capacity)?;
        let stats = Arc::new(DeliveryStats::default());
        let circuit = Arc::new(CircuitBreaker::new(
            format!("{source_name}/{}", destination.id),
            config.circuit,
        ));
        let cancel = CancellationToken::new();
        let kind = sink.kind();

        let worker = Worker {
            source: source_name.to_string(),
            destination: destination.id.clone(),
            collector: BatchCollector::new(
                receiver,
                BatchConfig {
                    max_size: config.max_batch_events.max(1),
                    max_wait_time: config.flush_interval,
                },
            ),
            sink,
            retry: RetryPolicy::new(config.retry.clone()),
            circuit: Arc::clone(&circuit),
            dead_letter,
            last_cleanup: None,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        info!(
            source = %source_name,
            destination = %destination.id,
            kind,
            queue_capacity = config.queue_capacity,
            "Destination dispatcher started"
        );

        Ok(Self {
            id: destination.id.clone(),
            name: destination.display_name().to_string(),
            kind,
            sender,
            stats,
            circuit,
            cancel,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queues a batch without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, batch: Arc<Batch>) -> bool {
        match self.sender.try_push(batch) {
            Ok(()) => true,
            Err(BufferError::Full) => {
                warn!(destination = %self.id, "Destination queue full, dropping batch");
                false
            }
            Err(e) => {
                debug!(destination = %self.id, error = %e, "Destination queue unavailable");
                false
            }
        }
    }

    pub fn queue_length(&self) -> usize {
        self.sender.len()
    }

    /// Events this destination has accepted.
    pub fn processed_count(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> DestinationMetrics {
        DestinationMetrics {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.to_string(),
            queue_length: self.queue_length(),
            processed_count: self.processed_count(),
            dropped_count: self.sender.stats().dropped(),
            failed_count: self.stats.failed.load(Ordering::Relaxed),
            retry_count: self.stats.retries.load(Ordering::Relaxed),
            circuit_state: self.circuit.state(),
            last_delivery_at: self.stats.last_delivery_at(),
            last_updated: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signals the worker and waits for it. Whatever is still queued gets a
    /// single delivery attempt before the worker exits.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(destination = %self.id, error = %e, "Destination worker panicked");
        }
    }
}

impl Drop for DestinationDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker<S> {
    source: String,
    destination: String,
    collector: BatchCollector<Arc<Batch>>,
    sink: S,
    retry: RetryPolicy,
    circuit: Arc<CircuitBreaker>,
    dead_letter: Option<DeadLetterStore>,
    last_cleanup: Option<Instant>,
    stats: Arc<DeliveryStats>,
    cancel: CancellationToken,
}

impl<S: Sink> Worker<S> {
    async fn run(mut self) {
        self.cleanup_dead_letters().await;

        while let Some(parts) = self
            .collector
            .next_batch_weighted(&self.cancel, |batch| batch.len())
            .await
        {
            self.deliver_parts(parts, self.cancel.is_cancelled()).await;
            if self.cancel.is_cancelled() {
                break;
            }
        }

        let rest = self.collector.drain();
        if !rest.is_empty() {
            debug!(destination = %self.destination, batches = rest.len(), "Flushing queued batches on shutdown");
            self.deliver_parts(rest, true).await;
        }

        if let Err(e) = self.sink.close().await {
            warn!(destination = %self.destination, error = %e, "Failed to close destination");
        }
        info!(source = %self.source, destination = %self.destination, "Destination dispatcher stopped");
    }

    async fn deliver_parts(&mut self, mut parts: Vec<Arc<Batch>>, final_pass: bool) {
        if parts.len() == 1 {
            if let Some(batch) = parts.pop() {
                self.deliver(&batch, final_pass).await;
            }
        } else {
            let merged = Batch::merge(&parts);
            self.deliver(&merged, final_pass).await;
        }
    }

    async fn deliver(&mut self, batch: &Batch, final_pass: bool) {
        if batch.is_empty() {
            return;
        }
        if !self.circuit.allow_request() {
            warn!(
                destination = %self.destination,
                batch_id = %batch.id(),
                events = batch.len(),
                "Circuit open, skipping delivery"
            );
            self.fail(batch).await;
            return;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sink.deliver(batch).await {
                Ok(receipt) => {
                    self.circuit.record_success();
                    self.stats
                        .processed
                        .fetch_add(receipt.events as u64, Ordering::Relaxed);
                    self.stats
                        .last_delivery_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                    debug!(
                        destination = %self.destination,
                        batch_id = %batch.id(),
                        events = receipt.events,
                        bytes = receipt.bytes,
                        attempt,
                        "Delivered batch"
                    );
                    return;
                }
                Err(e) => {
                    if !self.should_retry(&e, attempt, final_pass) {
                        error!(
                            destination = %self.destination,
                            batch_id = %batch.id(),
                            attempt,
                            error = %e,
                            "Delivery failed, giving up on batch"
                        );
                        self.circuit.record_failure();
                        self.fail(batch).await;
                        return;
                    }

                    let delay = self.retry.calculate_delay(attempt);
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        destination = %self.destination,
                        batch_id = %batch.id(),
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn should_retry(&self, error: &SinkError, attempt: u32, final_pass: bool) -> bool {
        error.is_retryable()
            && !final_pass
            && !self.cancel.is_cancelled()
            && self.retry.should_retry(attempt)
    }

    async fn fail(&mut self, batch: &Batch) {
        self.stats
            .failed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let Some(store) = self.dead_letter.as_mut() else {
            error!(
                destination = %self.destination,
                batch_id = %batch.id(),
                events = batch.len(),
                "No dead-letter store configured, discarding batch"
            );
            return;
        };

        match store.store_batch(batch).await {
            Ok(path) => warn!(
                destination = %self.destination,
                batch_id = %batch.id(),
                events = batch.len(),
                path = %path.display(),
                "Batch moved to dead-letter store"
            ),
            Err(e) => error!(
                destination = %self.destination,
                batch_id = %batch.id(),
                events = batch.len(),
                error = %e,
                "Failed to dead-letter batch, discarding"
            ),
        }

        self.cleanup_dead_letters().await;
    }

    async fn cleanup_dead_letters(&mut self) {
        if self
            .last_cleanup
            .is_some_and(|at| at.elapsed() < DEAD_LETTER_CLEANUP_INTERVAL)
        {
            return;
        }
        let Some(store) = self.dead_letter.as_mut() else {
            return;
        };
        self.last_cleanup = Some(Instant::now());
        if let Err(e) = store.cleanup_old_batches().await {
            warn!(destination = %self.destination, error = %e, "Dead-letter cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DestinationKind, LogEvent, StorageConfig};
    use crate::reliability::{CircuitState, DeadLetterConfig};
    use crate::sink::DeliveryReceipt;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct ScriptedSink {
        failures_left: Arc<AtomicU32>,
        permanent: bool,
        attempts: Arc<AtomicU32>,
        delivered: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedSink {
        fn failing(times: u32, permanent: bool) -> Self {
            let sink = Self {
                permanent,
                ..Self::default()
            };
            sink.failures_left.store(times, Ordering::SeqCst);
            sink
        }
    }

    impl Sink for ScriptedSink {
        fn kind(&self) -> &'static str {
            "storage"
        }

        async fn deliver(&mut self, batch: &Batch) -> Result<DeliveryReceipt, SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.permanent {
                    SinkError::InvalidConfiguration("bad".to_string())
                } else {
                    SinkError::HttpStatus {
                        status: 500,
                        message: "boom".to_string(),
                    }
                });
            }
            self.delivered.lock().push(batch.len());
            Ok(DeliveryReceipt {
                events: batch.len(),
                bytes: batch.byte_size(),
                status: None,
            })
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn destination() -> DestinationConfig {
        DestinationConfig {
            id: "d1".to_string(),
            name: "archive".to_string(),
            kind: DestinationKind::Storage(StorageConfig::new("/unused")),
            enabled: true,
        }
    }

    fn batch(n: usize) -> Arc<Batch> {
        let events = (0..n)
            .map(|i| {
                LogEvent::from_bytes(format!("m{i}").as_bytes(), "fw", "10.0.0.1", Utc::now(), false)
                    .unwrap()
            })
            .collect();
        Arc::new(Batch::new("10.0.0.1", events))
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_fixed_delay_then_succeeds() {
        let sink = ScriptedSink::failing(2, false);
        let attempts = Arc::clone(&sink.attempts);
        let dispatcher =
            DestinationDispatcher::spawn(&destination(), "fw", sink, None, &DispatchConfig::default())
                .unwrap();

        let started = tokio::time::Instant::now();
        assert!(dispatcher.enqueue(batch(3)));
        wait_for(|| dispatcher.processed_count() == 3).await;

        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let metrics = dispatcher.metrics();
        assert_eq!(metrics.retry_count, 2);
        assert_eq!(metrics.failed_count, 0);
        assert_eq!(metrics.circuit_state, CircuitState::Closed);
        assert!(metrics.last_delivery_at.is_some());
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn batches_within_flush_interval_are_delivered_together() {
        let sink = ScriptedSink::default();
        let attempts = Arc::clone(&sink.attempts);
        let delivered = Arc::clone(&sink.delivered);
        let dispatcher =
            DestinationDispatcher::spawn(&destination(), "fw", sink, None, &DispatchConfig::default())
                .unwrap();

        let started = tokio::time::Instant::now();
        assert!(dispatcher.enqueue(batch(1)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dispatcher.enqueue(batch(1)));
        wait_for(|| dispatcher.processed_count() == 2).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*delivered.lock(), vec![2]);
        assert!(started.elapsed() >= DEFAULT_FLUSH_INTERVAL);
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn full_delivery_does_not_wait_for_flush() {
        let sink = ScriptedSink::default();
        let delivered = Arc::clone(&sink.delivered);
        let config = DispatchConfig {
            max_batch_events: 4,
            ..DispatchConfig::default()
        };
        let dispatcher = DestinationDispatcher::spawn(&destination(), "fw", sink, None, &config).unwrap();

        let started = tokio::time::Instant::now();
        dispatcher.enqueue(batch(3));
        dispatcher.enqueue(batch(2));
        wait_for(|| dispatcher.processed_count() == 5).await;

        assert_eq!(*delivered.lock(), vec![5]);
        assert!(started.elapsed() < DEFAULT_FLUSH_INTERVAL);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_dead_letter_without_retry() {
        let dir = TempDir::new().unwrap();
        let store = DeadLetterStore::new(DeadLetterConfig::new(dir.path())).await.unwrap();
        let sink = ScriptedSink::failing(1, true);
        let attempts = Arc::clone(&sink.attempts);
        let dispatcher = DestinationDispatcher::spawn(
            &destination(),
            "fw",
            sink,
            Some(store),
            &DispatchConfig::default(),
        )
        .unwrap();

        dispatcher.enqueue(batch(4));
        wait_for(|| dispatcher.metrics().failed_count == 4).await;
        dispatcher.shutdown().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_delivery() {
        let sink = ScriptedSink::failing(1, true);
        let attempts = Arc::clone(&sink.attempts);
        let config = DispatchConfig {
            circuit: CircuitConfig {
                failure_threshold: 1,
                open_duration: Duration::from_secs(600),
            },
            ..DispatchConfig::default()
        };
        let dispatcher = DestinationDispatcher::spawn(&destination(), "fw", sink, None, &config).unwrap();

        dispatcher.enqueue(batch(1));
        wait_for(|| dispatcher.metrics().circuit_state == CircuitState::Open).await;
        dispatcher.enqueue(batch(2));
        wait_for(|| dispatcher.metrics().failed_count == 3).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.processed_count(), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops_only_new_batches() {
        let sink = ScriptedSink::default();
        let delivered = Arc::clone(&sink.delivered);
        let config = DispatchConfig {
            queue_capacity: 1,
            ..DispatchConfig::default()
        };
        let dispatcher = DestinationDispatcher::spawn(&destination(), "fw", sink, None, &config).unwrap();

        // The worker cannot run before the first await on this runtime.
        assert!(dispatcher.enqueue(batch(1)));
        assert!(!dispatcher.enqueue(batch(1)));
        assert!(!dispatcher.enqueue(batch(1)));
        assert_eq!(dispatcher.metrics().dropped_count, 2);

        wait_for(|| dispatcher.processed_count() == 1).await;
        assert_eq!(*delivered.lock(), vec![1]);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_batches() {
        let sink = ScriptedSink::default();
        let delivered = Arc::clone(&sink.delivered);
        let dispatcher =
            DestinationDispatcher::spawn(&destination(), "fw", sink, None, &DispatchConfig::default())
                .unwrap();

        dispatcher.enqueue(batch(2));
        dispatcher.enqueue(batch(5));
        dispatcher.shutdown().await;

        assert_eq!(delivered.lock().iter().sum::<usize>(), 7);
        assert!(!dispatcher.is_running());
    }
}
