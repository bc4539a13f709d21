use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ingest::RawMessage;
use crate::buffer::{BatchCollector, BatchConfig, QueueReceiver};
use crate::dispatch::DestinationDispatcher;
use crate::domain::{Batch, LogEvent, SourceConfig};
use crate::filter::{Aggregator, FilterEngine};
use crate::metrics::MetricsEngine;

/// Per-source batching loop: parse, filter, aggregate, meter, fan out.
pub struct LogProcessor {
    source: String,
    simulation: bool,
    collector: BatchCollector<RawMessage>,
    filter: FilterEngine,
    aggregator: Aggregator,
    metrics: Arc<MetricsEngine>,
    dispatchers: Arc<[DestinationDispatcher]>,
    processed: Arc<AtomicU64>,
}

impl LogProcessor {
    pub fn new(
        config: &SourceConfig,
        receiver: QueueReceiver<RawMessage>,
        batch: BatchConfig,
        metrics: Arc<MetricsEngine>,
        dispatchers: Arc<[DestinationDispatcher]>,
        processed: Arc<AtomicU64>,
    ) -> Self {
        Self {
            source: config.name.clone(),
            simulation: config.simulation_mode,
            collector: BatchCollector::new(receiver, batch),
            filter: FilterEngine::new(&config.filter_rules),
            aggregator: Aggregator::new(&config.aggregation_rules),
            metrics,
            dispatchers,
            processed,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(
            source = %self.source,
            batch_size = self.collector.config().max_size,
            flush_interval = ?self.collector.config().max_wait_time,
            "Log processor started"
        );

        while let Some(messages) = self.collector.next_batch(&cancel).await {
            self.process_batch(messages);
            if cancel.is_cancelled() {
                break;
            }
        }

        let rest = self.collector.drain();
        if !rest.is_empty() {
            self.process_batch(rest);
        }
        info!(source = %self.source, "Log processor stopped");
    }

    /// Handles one flushed batch and returns how many events were fanned out.
    pub fn process_batch(&mut self, messages: Vec<RawMessage>) -> usize {
        if messages.is_empty() {
            return 0;
        }

        if self.simulation {
            let bytes: u64 = messages.iter().map(|m| m.data.len() as u64).sum();
            self.metrics.record(messages.len() as u64, bytes);
            return 0;
        }

        let peer_ip = messages[0].peer_ip.clone();
        let events: Vec<LogEvent> = messages
            .iter()
            .filter_map(|m| {
                LogEvent::from_bytes(&m.data, &self.source, &m.peer_ip, m.received_at, false)
            })
            .collect();
        let received = events.len() as u64;
        let bytes: u64 = events.iter().map(|e| e.byte_size as u64).sum();

        // Parsed events are metered before filters drop any of them.
        self.metrics.record(received, bytes);

        let events = self.filter.apply(events);
        let events = self.aggregator.process(events);

        self.processed
            .fetch_add(events.len() as u64, Ordering::Relaxed);

        if events.is_empty() || self.dispatchers.is_empty() {
            return events.len();
        }

        let count = events.len();
        let batch = Arc::new(Batch::new(peer_ip, events));
        for dispatcher in &*self.dispatchers {
            dispatcher.enqueue(Arc::clone(&batch));
        }
        debug!(source = %self.source, received, forwarded = count, "Batch fanned out");
        count
    }
}
