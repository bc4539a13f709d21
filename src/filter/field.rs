use serde_json::Value;
use std::borrow::Cow;

use crate::domain::{LogEvent, Payload};

/// Text view of a field, used by filter rules. Only string-valued JSON
/// fields resolve; anything else reads as absent.
pub fn field_text<'a>(event: &'a LogEvent, field: &str) -> Option<Cow<'a, str>> {
    match field {
        "message" => match &event.payload {
            Payload::Raw(text) => Some(Cow::Borrowed(text.as_str())),
            Payload::Structured(Value::String(text)) => Some(Cow::Borrowed(text.as_str())),
            Payload::Structured(Value::Object(map)) => {
                map.get("message").and_then(Value::as_str).map(Cow::Borrowed)
            }
            Payload::Structured(_) => None,
        },
        "source" => Some(Cow::Borrowed(event.source.as_str())),
        "time" => Some(Cow::Owned(event.received_at.to_rfc3339())),
        other => match &event.payload {
            Payload::Structured(Value::Object(map)) => {
                map.get(other).and_then(Value::as_str).map(Cow::Borrowed)
            }
            _ => None,
        },
    }
}

/// JSON view of a field, used for aggregation keys. `message` resolves to
/// the whole payload.
pub fn field_value(event: &LogEvent, field: &str) -> Value {
    match field {
        "message" => event.payload.to_value(),
        "source" => Value::String(event.source.clone()),
        "time" => Value::String(event.received_at.to_rfc3339()),
        other => match &event.payload {
            Payload::Structured(Value::Object(map)) => {
                map.get(other).cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
        },
    }
}
