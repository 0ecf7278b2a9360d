//! Secondary index from identity to the clients bound to it

use std::collections::{HashMap, HashSet};

use crate::core::event::{ClientId, Identity};

#[derive(Debug, Default)]
pub struct IdentityIndex {
    clients: HashMap<Identity, HashSet<ClientId>>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, identity: Identity, client_id: &str) {
        self.clients
            .entry(identity)
            .or_default()
            .insert(client_id.to_string());
    }

    /// Drop one binding; the identity disappears with its last client
    pub fn unbind(&mut self, identity: Identity, client_id: &str) {
        if let Some(set) = self.clients.get_mut(&identity) {
            set.remove(client_id);
            if set.is_empty() {
                self.clients.remove(&identity);
            }
        }
    }

    /// Snapshot of the clients bound to `identity`
    pub fn clients_of(&self, identity: Identity) -> Vec<ClientId> {
        self.clients
            .get(&identity)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.clients.contains_key(&identity)
    }

    pub fn identity_count(&self) -> usize {
        self.clients.len()
    }
}
