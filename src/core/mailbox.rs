//! Per-client outbound queues for the poll transport
//!
//! Event-stream clients cannot be written to from a broadcast: events are
//! queued here and the client's stream drains its queue on every poll cycle.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::core::connection::ClientState;
use crate::core::event::{ClientId, Event, Identity};
use crate::core::identity_index::IdentityIndex;
use crate::core::sink::Sink;

struct PollClient {
    identity: Option<Identity>,
    created_at: Instant,
    last_activity: Instant,
    state: ClientState,
    queue: VecDeque<Event>,
}

#[derive(Default)]
pub struct Mailbox {
    clients: HashMap<ClientId, PollClient>,
    identities: IdentityIndex,
    /// Oldest entries are dropped past this many pending events
    capacity: Option<usize>,
    dropped: u64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Start tracking a poll client; an existing entry is replaced
    pub fn register(&mut self, client_id: &str, identity: Option<Identity>) {
        self.remove_client(client_id);
        let now = Instant::now();
        self.clients.insert(
            client_id.to_string(),
            PollClient {
                identity,
                created_at: now,
                last_activity: now,
                state: ClientState::Open,
                queue: VecDeque::new(),
            },
        );
        if let Some(identity) = identity {
            self.identities.bind(identity, client_id);
        }
        info!("Poll client {} registered (identity: {:?})", client_id, identity);
    }

    /// Append to a client's queue. Unknown clients are not queued for.
    pub fn enqueue(&mut self, client_id: &str, event: Event) -> bool {
        let capacity = self.capacity;
        let client = match self.clients.get_mut(client_id) {
            Some(client) if client.state.is_live() => client,
            _ => return false,
        };
        if let Some(capacity) = capacity {
            while client.queue.len() >= capacity.max(1) {
                client.queue.pop_front();
                self.dropped += 1;
                warn!("Mailbox for {} full, dropping oldest event", client_id);
            }
        }
        client.queue.push_back(event);
        true
    }

    /// Take everything queued since the previous drain
    pub fn drain(&mut self, client_id: &str) -> Vec<Event> {
        match self.clients.get_mut(client_id) {
            Some(client) => {
                client.last_activity = Instant::now();
                Vec::from(std::mem::take(&mut client.queue))
            }
            None => Vec::new(),
        }
    }

    /// Discard a client's queue and identity binding
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        match self.clients.remove(client_id) {
            Some(mut client) => {
                client.state = ClientState::Closed;
                if let Some(identity) = client.identity {
                    self.identities.unbind(identity, client_id);
                }
                debug!(
                    "Poll client {} removed after {:?}",
                    client_id,
                    client.created_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Enqueue for every poll client bound to `identity`
    pub fn send_to_identity(&mut self, identity: Identity, event: &Event) -> usize {
        self.identities
            .clients_of(identity)
            .iter()
            .filter(|client_id| self.enqueue(client_id, event.clone()))
            .count()
    }

    /// Drop pending events of the given clients, returning how many were dropped
    pub fn clear(&mut self, client_ids: &[ClientId]) -> usize {
        let mut cleared = 0;
        for id in client_ids {
            if let Some(client) = self.clients.get_mut(id) {
                cleared += client.queue.len();
                client.queue.clear();
            }
        }
        cleared
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn pending(&self, client_id: &str) -> usize {
        self.clients.get(client_id).map_or(0, |c| c.queue.len())
    }

    pub fn identity_of(&self, client_id: &str) -> Option<Identity> {
        self.clients.get(client_id).and_then(|c| c.identity)
    }

    pub fn clients_of(&self, identity: Identity) -> Vec<ClientId> {
        self.identities.clients_of(identity)
    }

    /// Clients that have not polled for longer than `timeout`
    pub fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, client)| client.last_activity.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.clients.values().filter(|c| c.identity.is_some()).count()
    }

    /// Events discarded because a queue hit its capacity
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

impl Sink for Mailbox {
    fn send(&mut self, client_id: &str, event: &Event) -> bool {
        self.enqueue(client_id, event.clone())
    }
}
