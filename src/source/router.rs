use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ingest::{IngestHandle, RawMessage};
use super::processor::LogProcessor;
use super::{PipelineSettings, SourceError};
use crate::buffer::bounded;
use crate::dispatch::DestinationDispatcher;
use crate::domain::{DestinationConfig, SourceConfig, SourceMetrics};
use crate::listener::{ListenerMultiplexer, ListenerProvider, MessageHandler};
use crate::metrics::MetricsEngine;
use crate::reliability::{DeadLetterConfig, DeadLetterStore};
use crate::sink::DestinationSink;

/// Everything a metrics refresh reads. Cheap to clone into the ticker task.
#[derive(Clone)]
struct MetricsView {
    config: Arc<SourceConfig>,
    engine: Arc<MetricsEngine>,
    ingest: Arc<IngestHandle>,
    dispatchers: Arc<[DestinationDispatcher]>,
    processed: Arc<AtomicU64>,
}

impl MetricsView {
    fn compute(&self, active: bool) -> SourceMetrics {
        let now = Utc::now();
        let realtime = self.engine.realtime();
        let hourly = self.engine.hourly_average();
        let daily = self.engine.daily_average_at(now);

        let mut dest_metrics = BTreeMap::new();
        let mut sent_count = 0;
        for dispatcher in &*self.dispatchers {
            let metrics = dispatcher.metrics();
            sent_count += metrics.processed_count;
            dest_metrics.insert(metrics.id.clone(), metrics);
        }

        SourceMetrics {
            name: self.config.name.clone(),
            source_ip: self.config.ip.clone(),
            port: self.config.port,
            protocol: self.config.protocol,
            simulation_mode: self.config.simulation_mode,
            realtime_eps: realtime.eps,
            realtime_gbps: realtime.gbps,
            total_logs_ingested: self.ingest.received_count(),
            total_bytes_ingested: self.ingest.received_bytes(),
            dropped_count: self.ingest.dropped_count(),
            hourly_avg_logs: hourly.logs_per_sec,
            hourly_avg_gb: hourly.gb_per_sec,
            daily_avg_logs: daily.logs_per_sec,
            daily_avg_gb: daily.gb_per_sec,
            queue_depth: self.ingest.queue_depth(),
            processed_count: self.processed.load(Ordering::Relaxed),
            sent_count,
            is_active: active,
            is_receiving: self.ingest.is_receiving_at(now),
            last_message_at: self.ingest.last_message_at(),
            last_updated: now,
            dest_metrics,
        }
    }
}

struct Running {
    view: MetricsView,
    listener: Arc<ListenerMultiplexer>,
    peer_key: String,
    cancel: CancellationToken,
    processor: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// One configured logical source: its ingestion queue, processor, metrics
/// ticker and destination dispatchers, plus its route on a shared listener.
pub struct SourceRouter {
    config: Arc<SourceConfig>,
    settings: PipelineSettings,
    listeners: Arc<dyn ListenerProvider>,
    engine: Arc<MetricsEngine>,
    snapshot: Arc<RwLock<SourceMetrics>>,
    ingest: RwLock<Option<Arc<IngestHandle>>>,
    running: Mutex<Option<Running>>,
}

impl SourceRouter {
    pub fn new(
        config: SourceConfig,
        settings: PipelineSettings,
        listeners: Arc<dyn ListenerProvider>,
    ) -> Self {
        let snapshot = idle_metrics(&config);
        Self {
            config: Arc::new(config),
            settings,
            listeners,
            engine: Arc::new(MetricsEngine::new()),
            snapshot: Arc::new(RwLock::new(snapshot)),
            ingest: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Builds the destination workers and processor, then registers on the
    /// shared listener. Configuration and bind failures are returned; nothing
    /// is left running when this fails.
    pub async fn start(&self) -> Result<(), SourceError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SourceError::AlreadyRunning(self.config.name.clone()));
        }

        self.config.validate()?;
        let peer_key = self.config.peer_key()?;

        let dispatchers: Arc<[DestinationDispatcher]> = Arc::from(self.spawn_dispatchers().await?);

        let (queue, receiver) = match bounded::<RawMessage>(self.settings.ingest_queue_capacity) {
            Ok(pair) => pair,
            Err(e) => {
                shutdown_dispatchers(&dispatchers).await;
                return Err(e.into());
            }
        };
        let ingest = Arc::new(IngestHandle::new(
            self.config.name.clone(),
            self.config.simulation_mode,
            queue,
            Arc::clone(&self.engine),
        ));

        let listener = match self.register(&peer_key, &ingest) {
            Ok(listener) => listener,
            Err(e) => {
                shutdown_dispatchers(&dispatchers).await;
                return Err(e);
            }
        };

        let processed = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();
        let processor = LogProcessor::new(
            &self.config,
            receiver,
            self.settings.batch,
            Arc::clone(&self.engine),
            Arc::clone(&dispatchers),
            Arc::clone(&processed),
        );
        let processor = tokio::spawn(processor.run(cancel.clone()));

        let view = MetricsView {
            config: Arc::clone(&self.config),
            engine: Arc::clone(&self.engine),
            ingest: Arc::clone(&ingest),
            dispatchers,
            processed,
        };
        *self.snapshot.write() = view.compute(true);
        let ticker = tokio::spawn(run_ticker(
            view.clone(),
            Arc::clone(&self.snapshot),
            self.settings.tick_interval,
            cancel.clone(),
        ));

        *self.ingest.write() = Some(ingest);
        *running = Some(Running {
            view,
            listener,
            peer_key,
            cancel,
            processor,
            ticker,
        });

        info!(
            source = %self.config.name,
            ip = %self.config.ip,
            port = self.config.port,
            protocol = %self.config.protocol,
            simulation = self.config.simulation_mode,
            destinations = self.config.enabled_destinations().count(),
            "Source started"
        );
        Ok(())
    }

    async fn spawn_dispatchers(&self) -> Result<Vec<DestinationDispatcher>, SourceError> {
        let mut dispatchers = Vec::new();
        if self.config.simulation_mode {
            return Ok(dispatchers);
        }

        for destination in self.config.enabled_destinations() {
            match self.spawn_dispatcher(destination).await {
                Ok(dispatcher) => dispatchers.push(dispatcher),
                Err(e) => {
                    shutdown_dispatchers(&dispatchers).await;
                    return Err(e);
                }
            }
        }
        Ok(dispatchers)
    }

    async fn spawn_dispatcher(
        &self,
        destination: &DestinationConfig,
    ) -> Result<DestinationDispatcher, SourceError> {
        let sink = DestinationSink::from_config(&destination.kind, &self.config.name).map_err(
            |source| SourceError::Destination {
                id: destination.id.clone(),
                source,
            },
        )?;

        let dead_letter = match &self.settings.dead_letter_dir {
            Some(root) => {
                let path = root.join(&self.config.name).join(&destination.id);
                let store = DeadLetterStore::new(DeadLetterConfig::new(path))
                    .await
                    .map_err(|source| SourceError::DeadLetter {
                        id: destination.id.clone(),
                        source,
                    })?;
                Some(store)
            }
            None => None,
        };

        Ok(DestinationDispatcher::spawn(
            destination,
            &self.config.name,
            sink,
            dead_letter,
            &self.settings.dispatch,
        )?)
    }

    fn register(
        &self,
        peer_key: &str,
        ingest: &Arc<IngestHandle>,
    ) -> Result<Arc<ListenerMultiplexer>, SourceError> {
        let listener = self
            .listeners
            .get_or_create_listener(self.config.protocol, self.config.port)?;
        let handler: Arc<dyn MessageHandler> = ingest.clone();
        if let Err(e) = listener.add_source(peer_key, handler) {
            if listener.source_count() == 0 {
                self.listeners
                    .release_listener(self.config.protocol, self.config.port);
            }
            return Err(e.into());
        }
        Ok(listener)
    }

    /// Deregisters immediately, then stops the pipeline. Messages already
    /// queued get a best-effort flush.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.listener.remove_source(&running.peer_key);
        if running.listener.source_count() == 0 {
            self.listeners
                .release_listener(self.config.protocol, self.config.port);
        }
        if !running.listener.is_running() {
            running.listener.close().await;
        }
        if let Some(ingest) = self.ingest.write().take() {
            ingest.close();
        }

        running.cancel.cancel();
        if let Err(e) = running.processor.await {
            error!(source = %self.config.name, error = %e, "Log processor task failed");
        }
        if let Err(e) = running.ticker.await
            && !e.is_cancelled()
        {
            warn!(source = %self.config.name, error = %e, "Metrics ticker task failed");
        }
        shutdown_dispatchers(&running.view.dispatchers).await;

        *self.snapshot.write() = running.view.compute(false);
        info!(source = %self.config.name, "Source stopped");
    }

    /// Entry point for messages routed to this source. Never blocks; a no-op
    /// when the source is not running.
    pub fn process_message(&self, data: &[u8], peer_ip: &str) {
        if let Some(ingest) = self.ingest.read().as_ref() {
            ingest.process_message(data, peer_ip);
        }
    }

    /// The metrics as of the last tick.
    pub fn get_metrics(&self) -> SourceMetrics {
        self.snapshot.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.ingest.read().is_some()
    }
}

impl std::fmt::Debug for SourceRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRouter")
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_ticker(
    view: MetricsView,
    snapshot: Arc<RwLock<SourceMetrics>>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                view.engine.tick();
                let metrics = view.compute(true);
                *snapshot.write() = metrics;
            }
        }
    }
}

/// Each dispatcher makes its final delivery attempt in parallel.
async fn shutdown_dispatchers(dispatchers: &[DestinationDispatcher]) {
    join_all(dispatchers.iter().map(DestinationDispatcher::shutdown)).await;
}

fn idle_metrics(config: &SourceConfig) -> SourceMetrics {
    SourceMetrics {
        name: config.name.clone(),
        source_ip: config.ip.clone(),
        port: config.port,
        protocol: config.protocol,
        simulation_mode: config.simulation_mode,
        realtime_eps: 0.0,
        realtime_gbps: 0.0,
        total_logs_ingested: 0,
        total_bytes_ingested: 0,
        dropped_count: 0,
        hourly_avg_logs: 0.0,
        hourly_avg_gb: 0.0,
        daily_avg_logs: 0.0,
        daily_avg_gb: 0.0,
        queue_depth: 0,
        processed_count: 0,
        sent_count: 0,
        is_active: false,
        is_receiving: false,
        last_message_at: None,
        last_updated: Utc::now(),
        dest_metrics: BTreeMap::new(),
    }
}
