use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

pub const HOURLY_CAPACITY: usize = 3600;
pub const DAILY_CAPACITY: usize = 1440;

/// One throughput sample. `span_secs` is the wall time the counts cover
/// (1 for per-second samples, 60 for per-minute rollups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDataPoint {
    pub timestamp: DateTime<Utc>,
    pub log_count: u64,
    pub byte_count: u64,
    pub span_secs: u32,
}

/// Per-second averages over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowAverage {
    pub logs_per_sec: f64,
    pub gb_per_sec: f64,
}

pub(crate) const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Fixed-capacity sample ring; the oldest sample is overwritten once full.
#[derive(Debug)]
pub struct RingBuffer {
    samples: Vec<Option<MetricDataPoint>>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn add(&mut self, sample: MetricDataPoint) {
        let capacity = self.samples.len();
        self.samples[self.head] = Some(sample);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDataPoint> {
        let capacity = self.samples.len();
        (0..self.len).filter_map(move |i| {
            let idx = (self.head + capacity - 1 - i) % capacity;
            self.samples[idx].as_ref()
        })
    }

    pub fn get_average(&self, window: Duration) -> WindowAverage {
        self.average_at(window, Utc::now())
    }

    /// Averages samples strictly newer than `now - window`.
    pub fn average_at(&self, window: Duration, now: DateTime<Utc>) -> WindowAverage {
        self.totals_at(window, now).average()
    }

    pub fn totals_at(&self, window: Duration, now: DateTime<Utc>) -> WindowTotals {
        let window = ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.iter()
            .filter(|s| s.timestamp > cutoff)
            .fold(WindowTotals::default(), |mut totals, s| {
                totals.add(s.log_count, s.byte_count, s.span_secs);
                totals
            })
    }
}

/// Raw sums behind a [`WindowAverage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub logs: u64,
    pub bytes: u64,
    pub span_secs: u64,
}

impl WindowTotals {
    pub fn add(&mut self, logs: u64, bytes: u64, span_secs: u32) {
        self.logs = self.logs.saturating_add(logs);
        self.bytes = self.bytes.saturating_add(bytes);
        self.span_secs += u64::from(span_secs.max(1));
    }

    pub fn average(&self) -> WindowAverage {
        if self.span_secs == 0 {
            return WindowAverage::default();
        }
        WindowAverage {
            logs_per_sec: self.logs as f64 / self.span_secs as f64,
            gb_per_sec: self.bytes as f64 / BYTES_PER_GB / self.span_secs as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample(at: DateTime<Utc>, logs: u64) -> MetricDataPoint {
        MetricDataPoint {
            timestamp: at,
            log_count: logs,
            byte_count: logs * 100,
            span_secs: 1,
        }
    }

    #[test]
    fn empty_ring_averages_to_zero() {
        let ring = RingBuffer::new(10);
        assert_eq!(ring.get_average(Duration::from_secs(60)), WindowAverage::default());
    }

    #[test]
    fn only_samples_inside_window_count() {
        let now = Utc::now();
        let mut ring = RingBuffer::new(10);
        ring.add(sample(now - ChronoDuration::seconds(120), 1000));
        ring.add(sample(now - ChronoDuration::seconds(2), 10));
        ring.add(sample(now - ChronoDuration::seconds(1), 30));

        let avg = ring.average_at(Duration::from_secs(60), now);
        assert!((avg.logs_per_sec - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn window_with_no_recent_samples_is_zero() {
        let now = Utc::now();
        let mut ring = RingBuffer::new(4);
        ring.add(sample(now - ChronoDuration::seconds(500), 7));
        assert_eq!(
            ring.average_at(Duration::from_secs(60), now),
            WindowAverage::default()
        );
    }

    #[test]
    fn rollup_samples_are_normalized_per_second() {
        let now = Utc::now();
        let mut ring = RingBuffer::new(4);
        ring.add(MetricDataPoint {
            timestamp: now,
            log_count: 600,
            byte_count: 0,
            span_secs: 60,
        });
        let avg = ring.average_at(Duration::from_secs(3600), now + ChronoDuration::seconds(1));
        assert!((avg.logs_per_sec - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn iter_is_newest_first() {
        let now = Utc::now();
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.add(sample(now + ChronoDuration::seconds(i), i as u64));
        }
        let counts: Vec<u64> = ring.iter().map(|s| s.log_count).collect();
        assert_eq!(counts, vec![4, 3, 2]);
    }

    proptest! {
        #[test]
        fn never_holds_more_than_capacity(capacity in 1usize..64, adds in 0usize..512) {
            let now = Utc::now();
            let mut ring = RingBuffer::new(capacity);
            for i in 0..adds {
                ring.add(sample(now + ChronoDuration::seconds(i as i64), 1));
            }
            prop_assert_eq!(ring.len(), adds.min(capacity));
            prop_assert_eq!(ring.iter().count(), adds.min(capacity));
        }

        #[test]
        fn evicted_samples_never_reach_the_average(capacity in 1usize..32, extra in 1usize..32) {
            // Old samples are huge, survivors are all 1; any leak of an
            // evicted sample would push the average above 1.
            let start = Utc::now();
            let mut ring = RingBuffer::new(capacity);
            for i in 0..extra {
                ring.add(sample(start + ChronoDuration::seconds(i as i64), 1_000_000));
            }
            for i in 0..capacity {
                ring.add(sample(start + ChronoDuration::seconds((extra + i) as i64), 1));
            }
            let now = start + ChronoDuration::seconds((extra + capacity) as i64);
            let avg = ring.average_at(Duration::from_secs(86_400), now);
            prop_assert!((avg.logs_per_sec - 1.0).abs() < 1e-9);
        }
    }
}
