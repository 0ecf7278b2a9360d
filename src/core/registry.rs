//! Registry of live push connections

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::connection::{ClientState, Connection};
use crate::core::event::{ClientId, Event, Identity};
use crate::core::identity_index::IdentityIndex;
use crate::core::sink::Sink;

/// Connection counts reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
}

/// Tracks push connections and which identity each one belongs to
#[derive(Default)]
pub struct Registry {
    connections: HashMap<ClientId, Connection>,
    identities: IdentityIndex,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a push connection.
    ///
    /// Last writer wins: a connection already registered under the same id
    /// is unbound and handed back so the caller can close its transport.
    pub fn connect(&mut self, mut connection: Connection) -> Option<Connection> {
        let replaced = self.disconnect(&connection.id);
        if replaced.is_some() {
            warn!("Client {} reconnected, replacing previous connection", connection.id);
        }

        if let Some(identity) = connection.identity {
            self.identities.bind(identity, &connection.id);
        }
        connection.transition(ClientState::Open);
        info!(
            "Client {} connected (identity: {:?})",
            connection.id, connection.identity
        );
        self.connections.insert(connection.id.clone(), connection);
        replaced
    }

    /// Remove a client and its identity binding. No-op when absent.
    pub fn disconnect(&mut self, client_id: &str) -> Option<Connection> {
        let connection = self.connections.remove(client_id)?;
        if let Some(identity) = connection.identity {
            self.identities.unbind(identity, client_id);
        }
        debug!("Client {} removed from registry", client_id);
        Some(connection)
    }

    /// Write to one client; a failed write disconnects it
    pub fn send_to_client(&mut self, client_id: &str, event: &Event) -> bool {
        let delivered = match self.connections.get(client_id) {
            Some(connection) => connection.send(event),
            None => return false,
        };
        if !delivered {
            if let Some(mut connection) = self.disconnect(client_id) {
                connection.transition(ClientState::Closed);
            }
        }
        delivered
    }

    /// Fan out to every client bound to `identity`
    pub fn send_to_identity(&mut self, identity: Identity, event: &Event) -> usize {
        self.identities
            .clients_of(identity)
            .iter()
            .filter(|client_id| self.send_to_client(client_id, event))
            .count()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_connections: self.connections.len(),
            authenticated_connections: self
                .connections
                .values()
                .filter(|c| c.identity.is_some())
                .count(),
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<&Connection> {
        self.connections.get(client_id)
    }

    pub fn generation_of(&self, client_id: &str) -> Option<u64> {
        self.connections.get(client_id).map(|c| c.generation)
    }

    pub fn identity_of(&self, client_id: &str) -> Option<Identity> {
        self.connections.get(client_id).and_then(|c| c.identity)
    }

    pub fn clients_of(&self, identity: Identity) -> Vec<ClientId> {
        self.identities.clients_of(identity)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.connections.keys().cloned().collect()
    }

    pub fn touch(&mut self, client_id: &str) {
        if let Some(connection) = self.connections.get_mut(client_id) {
            connection.touch();
        }
    }

    /// Ids of connections idle for longer than `timeout`
    pub fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_stale(timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Sink for Registry {
    fn send(&mut self, client_id: &str, event: &Event) -> bool {
        self.send_to_client(client_id, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use warp::ws::Message;

    fn push(id: &str, identity: Option<i64>) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(id.to_string(), identity.map(Identity), tx), rx)
    }

    #[test]
    fn test_connect_and_stats() {
        let mut registry = Registry::new();
        let (a, _rx_a) = push("a", Some(1));
        let (b, _rx_b) = push("b", None);
        registry.connect(a);
        registry.connect(b);

        assert_eq!(
            registry.stats(),
            RegistryStats {
                total_connections: 2,
                authenticated_connections: 1
            }
        );
        assert_eq!(registry.get("a").unwrap().state(), ClientState::Open);
    }

    #[test]
    fn test_reconnect_replaces_and_rebinds_identity() {
        let mut registry = Registry::new();
        let (first, _rx1) = push("a", Some(1));
        let (second, _rx2) = push("a", Some(2));
        assert!(registry.connect(first).is_none());

        let replaced = registry.connect(second).expect("previous connection handed back");
        assert_eq!(replaced.identity, Some(Identity(1)));
        assert!(registry.clients_of(Identity(1)).is_empty());
        assert_eq!(registry.clients_of(Identity(2)), vec!["a".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut registry = Registry::new();
        let (a, _rx) = push("a", Some(1));
        registry.connect(a);
        assert!(registry.disconnect("a").is_some());
        assert!(registry.disconnect("a").is_none());
        assert!(registry.is_empty());
        assert!(registry.clients_of(Identity(1)).is_empty());
    }

    #[test]
    fn test_failed_send_disconnects() {
        let mut registry = Registry::new();
        let (a, rx) = push("a", Some(1));
        registry.connect(a);
        drop(rx);

        assert!(!registry.send_to_client("a", &Event::new(json!({"type": "x"}))));
        assert!(!registry.contains("a"));
        assert_eq!(registry.stats().authenticated_connections, 0);
    }

    #[test]
    fn test_send_to_identity_counts_deliveries() {
        let mut registry = Registry::new();
        let (phone, mut rx_phone) = push("phone", Some(7));
        let (laptop, rx_laptop) = push("laptop", Some(7));
        registry.connect(phone);
        registry.connect(laptop);
        drop(rx_laptop);

        let event = Event::new(json!({"type": "notification"}));
        assert_eq!(registry.send_to_identity(Identity(7), &event), 1);
        assert!(rx_phone.try_recv().is_ok());
        assert_eq!(registry.send_to_identity(Identity(99), &event), 0);
    }
}
