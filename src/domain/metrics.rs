use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::source::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationMetrics {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub queue_length: usize,
    pub processed_count: u64,
    pub dropped_count: u64,
    pub failed_count: u64,
    pub retry_count: u64,
    pub circuit_state: CircuitState,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time view of one logical source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetrics {
    pub name: String,
    pub source_ip: String,
    pub port: u16,
    pub protocol: Protocol,
    pub simulation_mode: bool,
    pub realtime_eps: f64,
    pub realtime_gbps: f64,
    pub total_logs_ingested: u64,
    pub total_bytes_ingested: u64,
    pub dropped_count: u64,
    pub hourly_avg_logs: f64,
    pub hourly_avg_gb: f64,
    pub daily_avg_logs: f64,
    pub daily_avg_gb: f64,
    pub queue_depth: usize,
    pub processed_count: u64,
    pub sent_count: u64,
    pub is_active: bool,
    pub is_receiving: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub dest_metrics: BTreeMap<String, DestinationMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_realtime_eps: f64,
    pub total_realtime_gbps: f64,
    pub total_hourly_avg_logs: f64,
    pub total_hourly_avg_gb: f64,
    pub total_daily_avg_logs: f64,
    pub total_daily_avg_gb: f64,
    pub total_logs_ingested: u64,
    pub active_sources: usize,
    pub total_sources: usize,
}

impl GlobalMetrics {
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = &'a SourceMetrics>) -> Self {
        let mut global = GlobalMetrics::default();
        for source in sources {
            global.total_sources += 1;
            if source.is_active {
                global.active_sources += 1;
            }
            global.total_realtime_eps += source.realtime_eps;
            global.total_realtime_gbps += source.realtime_gbps;
            global.total_hourly_avg_logs += source.hourly_avg_logs;
            global.total_hourly_avg_gb += source.hourly_avg_gb;
            global.total_daily_avg_logs += source.daily_avg_logs;
            global.total_daily_avg_gb += source.daily_avg_gb;
            global.total_logs_ingested += source.total_logs_ingested;
        }
        global
    }
}
