//! Wire messages for the push transport and control-plane listings

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_CHANNEL;
use crate::core::event::Identity;

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn empty_content() -> Value {
    Value::String(String::new())
}

/// Client-to-server message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness check, answered with `pong`
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },

    Subscribe { channel: String },

    Unsubscribe { channel: String },

    JoinRoom { room_id: String },

    LeaveRoom { room_id: String },

    /// Publish to a channel (requires identity)
    Broadcast {
        #[serde(default = "default_channel")]
        channel: String,
        #[serde(default = "empty_content")]
        content: Value,
        #[serde(default)]
        timestamp: Option<Value>,
    },

    /// Send to every client of another identity (requires identity)
    PrivateMessage {
        target_user_id: Identity,
        #[serde(default = "empty_content")]
        content: Value,
        #[serde(default)]
        timestamp: Option<Value>,
    },

    /// Publish to a room (requires identity)
    RoomMessage {
        room_id: String,
        #[serde(default = "empty_content")]
        content: Value,
        #[serde(default)]
        timestamp: Option<Value>,
    },

    /// Any `type` not listed above
    #[serde(other)]
    Unknown,
}

/// Why an inbound frame could not become a `ClientMessage`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    InvalidJson,
    UnknownType(String),
    InvalidFields(String),
}

impl FrameError {
    /// Text of the `error` frame sent back to the client
    pub fn client_message(&self) -> String {
        match self {
            FrameError::InvalidJson => "Invalid JSON format".to_string(),
            FrameError::UnknownType(kind) => format!("Unknown message type: {}", kind),
            FrameError::InvalidFields(kind) => format!("Invalid {} message", kind),
        }
    }
}

impl ClientMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;
        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        match serde_json::from_value::<ClientMessage>(value) {
            Ok(ClientMessage::Unknown) => Err(FrameError::UnknownType(kind)),
            Ok(message) => Ok(message),
            // A missing or non-string tag fails before reaching the catch-all
            Err(_) if !Self::is_known_type(&kind) => Err(FrameError::UnknownType(kind)),
            Err(_) => Err(FrameError::InvalidFields(kind)),
        }
    }

    fn is_known_type(kind: &str) -> bool {
        matches!(
            kind,
            "ping"
                | "subscribe"
                | "unsubscribe"
                | "join_room"
                | "leave_room"
                | "broadcast"
                | "private_message"
                | "room_message"
        )
    }
}

/// Server-to-client message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when a socket is registered
    Connection {
        message: String,
        client_id: String,
        authenticated: bool,
    },

    Pong { timestamp: Option<Value> },

    Subscribed { channel: String, message: String },

    Unsubscribed { channel: String, message: String },

    JoinedRoom { room_id: String, message: String },

    LeftRoom { room_id: String, message: String },

    Broadcast {
        channel: String,
        user_id: Identity,
        content: Value,
        timestamp: Option<Value>,
    },

    RoomMessage {
        room_id: String,
        user_id: Identity,
        content: Value,
        timestamp: Option<Value>,
    },

    PrivateMessage {
        from_user_id: Identity,
        content: Value,
        timestamp: Option<Value>,
    },

    MessageSent { message: String },

    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Channel information for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscriber_count: usize,
}

/// Room information for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub member_count: usize,
}
