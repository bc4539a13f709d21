use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::domain::{LogEvent, Payload};

/// One line of a storage or dead-letter file.
#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    pub time: DateTime<Utc>,
    pub event: &'a Payload,
    pub source: &'a str,
    pub simulation_mode: bool,
}

impl<'a> From<&'a LogEvent> for EventRecord<'a> {
    fn from(event: &'a LogEvent) -> Self {
        Self {
            time: event.received_at,
            event: &event.payload,
            source: &event.source,
            simulation_mode: event.simulation,
        }
    }
}

/// One event as posted to an HTTP event collector.
#[derive(Debug, Serialize)]
pub struct HecEvent<'a> {
    /// Epoch seconds with millisecond precision.
    pub time: f64,
    pub host: &'a str,
    pub source: &'a str,
    pub event: &'a Payload,
}

impl<'a> From<&'a LogEvent> for HecEvent<'a> {
    fn from(event: &'a LogEvent) -> Self {
        Self {
            time: event.received_at.timestamp_millis() as f64 / 1000.0,
            host: &event.peer_ip,
            source: &event.source,
            event: &event.payload,
        }
    }
}

pub fn serialize_ndjson<T: Serialize>(records: &[T]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::with_capacity(records.len() * 256);
    for record in records {
        serde_json::to_writer(&mut buffer, record)?;
        buffer
            .write_all(b"\n")
            .map_err(serde_json::Error::io)?;
    }
    Ok(buffer)
}

pub fn serialize_json_array<T: Serialize>(records: &[T]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(records)
}
