//! Push connection management
//! Handles the lifecycle of duplex socket clients

use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use warp::ws::Message;

use crate::core::event::{ClientId, Event, Identity};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Monotonic number distinguishing successive clients that reuse an id
pub fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Per-client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Open,
    Closing,
    /// Terminal
    Closed,
}

impl ClientState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, ClientState::Connecting | ClientState::Open)
    }
}

/// Represents the state of a single push connection
pub struct Connection {
    pub id: ClientId,
    pub identity: Option<Identity>,
    pub generation: u64,
    pub connected_at: Instant,
    sender: mpsc::UnboundedSender<Message>,
    last_seen: Instant,
    state: ClientState,
}

impl Connection {
    pub fn new(
        id: ClientId,
        identity: Option<Identity>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            generation: next_generation(),
            connected_at: now,
            sender,
            last_seen: now,
            state: ClientState::Connecting,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Move to `next`; illegal transitions are ignored
    pub fn transition(&mut self, next: ClientState) -> bool {
        if self.state.can_transition_to(next) {
            debug!("Client {} state {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Serialize and write an event to this connection
    pub fn send(&self, event: &Event) -> bool {
        if !self.state.is_live() {
            return false;
        }
        match self.sender.send(Message::text(event.to_json())) {
            Ok(_) => true,
            Err(_) => {
                warn!("Failed to send message to client {}", self.id);
                false
            }
        }
    }

    /// Ask the socket to close and mark the connection closed
    pub fn close(&mut self) {
        if self.transition(ClientState::Closing) {
            // The forwarder may already be gone; nothing left to close then
            let _ = self.sender.send(Message::close());
        }
        self.transition(ClientState::Closed);
    }

    /// Record inbound activity
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Check if the connection is idle for longer than `timeout`
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_machine_transitions() {
        assert!(ClientState::Connecting.can_transition_to(ClientState::Open));
        assert!(ClientState::Open.can_transition_to(ClientState::Closing));
        assert!(ClientState::Connecting.can_transition_to(ClientState::Closed));
        assert!(!ClientState::Closed.can_transition_to(ClientState::Open));
        assert!(!ClientState::Open.can_transition_to(ClientState::Connecting));
    }

    #[test]
    fn test_send_and_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new("a".to_string(), None, tx);
        conn.transition(ClientState::Open);

        assert!(conn.send(&Event::new(json!({"type": "test"}))));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.to_str().unwrap(), r#"{"type":"test"}"#);

        conn.close();
        assert_eq!(conn.state(), ClientState::Closed);
        assert!(rx.try_recv().unwrap().is_close());
        assert!(!conn.send(&Event::new(json!({"type": "late"}))));
    }

    #[test]
    fn test_send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new("a".to_string(), Some(Identity(1)), tx);
        drop(rx);
        assert!(!conn.send(&Event::new(json!({}))));
    }

    #[test]
    fn test_generations_are_distinct() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = Connection::new("a".to_string(), None, tx.clone());
        let second = Connection::new("a".to_string(), None, tx);
        assert_ne!(first.generation, second.generation);
    }
}
