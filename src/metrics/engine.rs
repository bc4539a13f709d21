use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::ring::{
    BYTES_PER_GB, DAILY_CAPACITY, HOURLY_CAPACITY, MetricDataPoint, RingBuffer, WindowAverage,
    WindowTotals,
};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);
const ROLLUP_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RealtimeRates {
    pub eps: f64,
    pub gbps: f64,
}

#[derive(Debug)]
struct TickState {
    last_tick: Instant,
    realtime: RealtimeRates,
    minute_started: DateTime<Utc>,
    minute: WindowTotals,
}

/// Sliding-window throughput for one source.
///
/// Writers call [`record`](Self::record) from any task; a single ticker calls
/// [`tick`](Self::tick) once per second. Per-second samples land in a 3600
/// slot ring for the hourly figure and are rolled up per minute into a 1440
/// slot ring for the daily figure, so both windows are fully backed.
#[derive(Debug)]
pub struct MetricsEngine {
    pending_logs: AtomicU64,
    pending_bytes: AtomicU64,
    total_logs: AtomicU64,
    total_bytes: AtomicU64,
    state: Mutex<TickState>,
    hourly: RwLock<RingBuffer>,
    daily: RwLock<RingBuffer>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEngine {
    pub fn new() -> Self {
        Self::with_capacity(HOURLY_CAPACITY, DAILY_CAPACITY)
    }

    pub fn with_capacity(hourly: usize, daily: usize) -> Self {
        Self {
            pending_logs: AtomicU64::new(0),
            pending_bytes: AtomicU64::new(0),
            total_logs: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            state: Mutex::new(TickState {
                last_tick: Instant::now(),
                realtime: RealtimeRates::default(),
                minute_started: Utc::now(),
                minute: WindowTotals::default(),
            }),
            hourly: RwLock::new(RingBuffer::new(hourly)),
            daily: RwLock::new(RingBuffer::new(daily)),
        }
    }

    pub fn record(&self, logs: u64, bytes: u64) {
        self.pending_logs.fetch_add(logs, Ordering::Relaxed);
        self.pending_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_logs.fetch_add(logs, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tick(&self) -> RealtimeRates {
        self.tick_at(Instant::now(), Utc::now())
    }

    pub fn tick_at(&self, now: Instant, wall: DateTime<Utc>) -> RealtimeRates {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_tick);
        if elapsed.is_zero() {
            return state.realtime;
        }

        let logs = self.pending_logs.swap(0, Ordering::Relaxed);
        let bytes = self.pending_bytes.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        state.last_tick = now;
        state.realtime = RealtimeRates {
            eps: logs as f64 / secs,
            gbps: bytes as f64 / BYTES_PER_GB / secs,
        };

        let span_secs = secs.round().max(1.0) as u32;
        self.hourly.write().add(MetricDataPoint {
            timestamp: wall,
            log_count: logs,
            byte_count: bytes,
            span_secs,
        });

        state.minute.add(logs, bytes, span_secs);
        if state.minute.span_secs >= ROLLUP_SECS {
            let minute = std::mem::take(&mut state.minute);
            self.daily.write().add(MetricDataPoint {
                timestamp: state.minute_started,
                log_count: minute.logs,
                byte_count: minute.bytes,
                span_secs: minute.span_secs as u32,
            });
            state.minute_started = wall;
        }

        state.realtime
    }

    pub fn realtime(&self) -> RealtimeRates {
        self.state.lock().realtime
    }

    pub fn hourly_average(&self) -> WindowAverage {
        self.hourly.read().get_average(HOUR)
    }

    /// Daily figure from the minute rollups plus the minute still being
    /// accumulated.
    pub fn daily_average(&self) -> WindowAverage {
        self.daily_average_at(Utc::now())
    }

    pub fn daily_average_at(&self, now: DateTime<Utc>) -> WindowAverage {
        let mut totals = self.daily.read().totals_at(DAY, now);
        let minute = self.state.lock().minute;
        if minute.span_secs > 0 {
            totals.logs = totals.logs.saturating_add(minute.logs);
            totals.bytes = totals.bytes.saturating_add(minute.bytes);
            totals.span_secs += minute.span_secs;
        }
        totals.average()
    }

    pub fn total_logs(&self) -> u64 {
        self.total_logs.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn hourly_samples(&self) -> usize {
        self.hourly.read().len()
    }

    pub fn daily_samples(&self) -> usize {
        self.daily.read().len()
    }
}
