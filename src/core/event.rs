//! Events flowing through the hub and the identifiers they are routed by

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::HubError;

/// Transport-level client identifier
pub type ClientId = String;

/// Authenticated user identity, verified upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub i64);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Identity)
            .map_err(|_| HubError::ValidationError(format!("Invalid identity: {}", s)))
    }
}

/// How a client is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Duplex socket, written to directly
    Push,
    /// Event stream fed from a mailbox on every poll cycle
    Poll,
}

/// A JSON payload delivered to clients.
///
/// Events are opaque to the hub apart from two optional fields: `type`,
/// used as the event name on the poll transport, and `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Value);

impl Event {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Build an event from any serializable server message
    pub fn from_message<T: Serialize>(message: &T) -> crate::error::Result<Self> {
        Ok(Self(serde_json::to_value(message)?))
    }

    /// Control-plane envelope: `{id, type, channel?, data, timestamp}`
    pub fn envelope(kind: &str, id_prefix: &str, channel: Option<&str>, data: Value) -> Self {
        let mut value = json!({
            "id": new_event_id(id_prefix),
            "type": kind,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let (Some(channel), Some(map)) = (channel, value.as_object_mut()) {
            map.insert("channel".to_string(), Value::String(channel.to_string()));
        }
        Self(value)
    }

    /// Synthetic keep-alive for poll clients
    pub fn heartbeat(client_id: &str) -> Self {
        Self(json!({
            "type": "heartbeat",
            "timestamp": Utc::now().to_rfc3339(),
            "client_id": client_id,
        }))
    }

    /// Event name, `message` when the payload carries no `type`
    pub fn kind(&self) -> &str {
        self.0
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
    }

    pub fn id(&self) -> Option<String> {
        match self.0.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn to_json(&self) -> String {
        self.0.to_string()
    }
}

impl From<Value> for Event {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Generate an event id with a readable prefix
pub fn new_event_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_defaults_to_message() {
        let event = Event::new(json!({"content": "hi"}));
        assert_eq!(event.kind(), "message");
        assert_eq!(event.id(), None);

        let typed = Event::new(json!({"type": "test", "id": 7}));
        assert_eq!(typed.kind(), "test");
        assert_eq!(typed.id(), Some("7".to_string()));
    }

    #[test]
    fn test_envelope_carries_channel() {
        let event = Event::envelope("broadcast", "msg", Some("general"), json!({"content": "x"}));
        assert_eq!(event.kind(), "broadcast");
        assert_eq!(event.as_value()["channel"], "general");
        assert!(event.id().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_identity_parse() {
        assert_eq!("42".parse::<Identity>().unwrap(), Identity(42));
        assert!("abc".parse::<Identity>().is_err());
    }
}
