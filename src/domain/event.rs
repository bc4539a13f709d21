use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Body of a received message. Anything that parses as JSON is kept
/// structured, everything else stays an opaque string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(Value),
    Raw(String),
}

impl Payload {
    /// Parse raw bytes off the wire. Returns `None` for empty or
    /// whitespace-only messages, which carry nothing worth forwarding.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(data);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => Some(Self::Structured(value)),
            Err(_) => Some(Self::Raw(trimmed.to_string())),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Structured(value) => value.clone(),
            Self::Raw(text) => Value::String(text.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub peer_ip: String,
    pub payload: Payload,
    pub byte_size: usize,
    pub simulation: bool,
}

impl LogEvent {
    pub fn from_bytes(
        data: &[u8],
        source: &str,
        peer_ip: &str,
        received_at: DateTime<Utc>,
        simulation: bool,
    ) -> Option<Self> {
        let payload = Payload::parse(data)?;
        Some(Self {
            received_at,
            source: source.to_string(),
            peer_ip: peer_ip.to_string(),
            payload,
            byte_size: data.len(),
            simulation,
        })
    }
}

/// Ordered events handed from a processor to the destination queues.
#[derive(Debug, Clone)]
pub struct Batch {
    id: String,
    source_ip: String,
    created_at: DateTime<Utc>,
    events: Vec<LogEvent>,
}

impl Batch {
    pub fn new(source_ip: impl Into<String>, events: Vec<LogEvent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_ip: source_ip.into(),
            created_at: Utc::now(),
            events,
        }
    }

    /// Concatenate several queued batches into one delivery unit, keeping
    /// queue order.
    pub fn merge<I>(parts: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<Batch>,
    {
        let mut source_ip = String::new();
        let mut events = Vec::new();
        for part in parts {
            let part = part.as_ref();
            if source_ip.is_empty() {
                source_ip.clone_from(&part.source_ip);
            }
            events.extend(part.events.iter().cloned());
        }
        Self::new(source_ip, events)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_ip(&self) -> &str {
        &self.source_ip
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.events.iter().map(|e| e.byte_size).sum()
    }
}

impl AsRef<Batch> for Batch {
    fn as_ref(&self) -> &Batch {
        self
    }
}
