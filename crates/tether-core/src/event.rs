use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SYSTEM_EVENT_TYPE: &str = "system_event";

/// Event types the transcript writer records as conversation messages.
pub const HISTORY_BACKED_TYPES: &[&str] = &["user", "assistant"];

/// `system_event` subtypes the transcript writer persists. Everything else is transient.
pub const HISTORY_BACKED_SYSTEM_SUBTYPES: &[&str] = &["compact_boundary"];

/// Keys the bridge attaches to outgoing frames; agents may not set them.
const RESERVED_KEYS: &[&str] = &["seq", "sessionId"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayClass {
    HistoryBacked,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event must be a JSON object")]
    NotAnObject,
    #[error("event is missing a string `type`")]
    MissingType,
    #[error("event `subtype` must be a string")]
    InvalidSubtype,
    #[error("event `timestamp` must be a string")]
    InvalidTimestamp,
}

impl SessionEvent {
    pub fn new(event_type: impl Into<String>, subtype: Option<&str>) -> Self {
        Self {
            event_type: event_type.into(),
            subtype: subtype.map(str::to_string),
            timestamp: Utc::now().to_rfc3339(),
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if !RESERVED_KEYS.contains(&key) {
            self.payload.insert(key.to_string(), value);
        }
        self
    }

    /// Validates an agent-supplied value at the ingest boundary.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let Value::Object(mut map) = value else {
            return Err(EventError::NotAnObject);
        };

        let event_type = match map.remove("type") {
            Some(Value::String(value)) if !value.trim().is_empty() => value,
            _ => return Err(EventError::MissingType),
        };
        let subtype = match map.remove("subtype") {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => Some(value),
            Some(_) => return Err(EventError::InvalidSubtype),
        };
        let timestamp = match map.remove("timestamp") {
            None | Some(Value::Null) => Utc::now().to_rfc3339(),
            Some(Value::String(value)) if !value.is_empty() => value,
            Some(Value::String(_)) => Utc::now().to_rfc3339(),
            Some(_) => return Err(EventError::InvalidTimestamp),
        };
        for key in RESERVED_KEYS {
            map.remove(*key);
        }

        Ok(Self {
            event_type,
            subtype,
            timestamp,
            payload: map,
        })
    }

    pub fn replay_class(&self) -> ReplayClass {
        classify(&self.event_type, self.subtype.as_deref())
    }

    pub fn is_history_backed(&self) -> bool {
        self.replay_class() == ReplayClass::HistoryBacked
    }
}

/// Pure over `(type, subtype)`. Unknown combinations are transient so a mismatch with the
/// transcript writer causes a duplicate rather than a silent loss.
pub fn classify(event_type: &str, subtype: Option<&str>) -> ReplayClass {
    if HISTORY_BACKED_TYPES.contains(&event_type) {
        return ReplayClass::HistoryBacked;
    }
    if event_type == SYSTEM_EVENT_TYPE {
        if let Some(subtype) = subtype {
            if HISTORY_BACKED_SYSTEM_SUBTYPES.contains(&subtype) {
                return ReplayClass::HistoryBacked;
            }
        }
    }
    ReplayClass::Transient
}

pub fn is_history_backed(event: &SessionEvent) -> bool {
    event.is_history_backed()
}
