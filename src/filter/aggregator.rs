use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use std::collections::HashMap;

use super::field::field_value;
use crate::domain::{AggregationRule, LogEvent, Payload};

#[derive(Debug, Clone)]
struct AggregationGroup {
    key: String,
    sample: LogEvent,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    count: u64,
}

impl AggregationGroup {
    fn summarize(&self) -> LogEvent {
        let payload = json!({
            "aggregated_message": format!("Aggregated {} similar events", self.count),
            "count": self.count,
            "first_seen": self.first_seen.to_rfc3339(),
            "last_seen": self.last_seen.to_rfc3339(),
            "group_key": self.key,
            "sample_event": self.sample.payload.to_value(),
        });

        LogEvent {
            received_at: self.last_seen,
            source: self.sample.source.clone(),
            peer_ip: self.sample.peer_ip.clone(),
            payload: Payload::Structured(payload),
            byte_size: self.sample.byte_size,
            simulation: self.sample.simulation,
        }
    }
}

/// Time-windowed grouping of events by the values of `group_by` fields.
///
/// Only the first configured rule is used. Groups keep their first event as
/// a sample plus counters, not every member event.
#[derive(Debug, Default)]
pub struct Aggregator {
    rule: Option<AggregationRule>,
    groups: HashMap<String, AggregationGroup>,
}

impl Aggregator {
    pub fn new(rules: &[AggregationRule]) -> Self {
        if rules.len() > 1 {
            tracing::warn!(
                configured = rules.len(),
                "Only the first aggregation rule is applied"
            );
        }
        Self {
            rule: rules.first().cloned(),
            groups: HashMap::new(),
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn process(&mut self, events: Vec<LogEvent>) -> Vec<LogEvent> {
        self.process_at(events, Utc::now())
    }

    /// Purge stale groups, fold in the batch, then emit one summary per live
    /// group, oldest group first.
    pub fn process_at(&mut self, events: Vec<LogEvent>, now: DateTime<Utc>) -> Vec<LogEvent> {
        let Some(rule) = &self.rule else {
            return events;
        };

        let window = ChronoDuration::from_std(rule.time_window).unwrap_or(ChronoDuration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.groups.retain(|_, group| group.last_seen >= cutoff);

        for event in events {
            let key = group_key(&event, &rule.group_by);
            match self.groups.get_mut(&key) {
                Some(group) => {
                    group.count += 1;
                    if event.received_at > group.last_seen {
                        group.last_seen = event.received_at;
                    }
                }
                None => {
                    let group = AggregationGroup {
                        key: key.clone(),
                        first_seen: event.received_at,
                        last_seen: event.received_at,
                        count: 1,
                        sample: event,
                    };
                    self.groups.insert(key, group);
                }
            }
        }

        let mut live: Vec<&AggregationGroup> = self.groups.values().collect();
        live.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.key.cmp(&b.key)));
        live.into_iter().map(AggregationGroup::summarize).collect()
    }
}

/// md5 over the JSON array of extracted values, in `group_by` order.
pub fn group_key(event: &LogEvent, group_by: &[String]) -> String {
    let values: Vec<Value> = group_by.iter().map(|f| field_value(event, f)).collect();
    let encoded = Value::Array(values).to_string();
    format!("{:x}", md5::compute(encoded.as_bytes()))
}
