use chrono::{Duration as ChronoDuration, Utc};
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use rask_syslog_relay::domain::{
    AggregationRule, FilterAction, FilterOperator, FilterRule, LogEvent,
};
use rask_syslog_relay::filter::{Aggregator, FilterEngine};
use rask_syslog_relay::metrics::ring::HOURLY_CAPACITY;
use rask_syslog_relay::metrics::{MetricDataPoint, RingBuffer};
use std::time::Duration;

fn sample_events(count: usize) -> Vec<LogEvent> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let data = if i % 3 == 0 {
                format!(r#"{{"message":"denied udp 10.0.{}.{}","action":"deny","host":"fw{}"}}"#, i % 8, i % 250, i % 4)
            } else {
                format!("<134>Oct 16 10:00:00 fw{} accepted tcp 10.0.0.{} DEBUG={}", i % 4, i % 250, i % 2 == 0)
            };
            LogEvent::from_bytes(data.as_bytes(), "firewall", "10.0.0.5", now, false).unwrap()
        })
        .collect()
}

fn benchmark_filter_engine(c: &mut Criterion) {
    let rules = vec![
        FilterRule {
            field: "message".to_string(),
            operator: FilterOperator::Contains,
            value: "DEBUG=true".to_string(),
            action: FilterAction::Exclude,
        },
        FilterRule {
            field: "action".to_string(),
            operator: FilterOperator::Equals,
            value: "deny".to_string(),
            action: FilterAction::Include,
        },
        FilterRule {
            field: "message".to_string(),
            operator: FilterOperator::Regex,
            value: r"accepted tcp 10\.0\.0\.\d+".to_string(),
            action: FilterAction::Include,
        },
    ];
    let engine = FilterEngine::new(&rules);
    let events = sample_events(1000);

    let mut group = c.benchmark_group("filter_engine");
    group.throughput(Throughput::Elements(events.len() as u64));

    group.bench_function("apply_1000_events", |b| {
        b.iter_batched(
            || events.clone(),
            |batch| std::hint::black_box(engine.apply(batch)),
            BatchSize::SmallInput,
        );
    });

    group.bench_function("aggregate_1000_events", |b| {
        let rules = vec![AggregationRule {
            group_by: vec!["host".to_string()],
            time_window: Duration::from_secs(60),
        }];
        b.iter_batched(
            || (Aggregator::new(&rules), events.clone()),
            |(mut aggregator, batch)| std::hint::black_box(aggregator.process(batch)),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn benchmark_metrics_ring(c: &mut Criterion) {
    let start = Utc::now();

    c.bench_function("ring_add_hourly", |b| {
        let mut ring = RingBuffer::new(HOURLY_CAPACITY);
        let mut second = 0i64;
        b.iter(|| {
            second += 1;
            ring.add(MetricDataPoint {
                timestamp: start + ChronoDuration::seconds(second),
                log_count: 1000,
                byte_count: 250_000,
                span_secs: 1,
            });
        });
    });

    c.bench_function("ring_hourly_average_full", |b| {
        let mut ring = RingBuffer::new(HOURLY_CAPACITY);
        for second in 0..HOURLY_CAPACITY as i64 {
            ring.add(MetricDataPoint {
                timestamp: start - ChronoDuration::seconds(second),
                log_count: 1000,
                byte_count: 250_000,
                span_secs: 1,
            });
        }
        b.iter(|| std::hint::black_box(ring.get_average(Duration::from_secs(3600))));
    });
}

criterion_group!(benches, benchmark_filter_engine, benchmark_metrics_ring);
criterion_main!(benches);
