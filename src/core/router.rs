//! Channel subscriptions and room memberships
//!
//! Both are the same many-to-many relation between names and clients. A
//! channel is topic oriented, a room groups the clients of one session after
//! an explicit join. Empty sets are dropped, so an unknown name and an empty
//! one look the same.

use log::{debug, info};
use std::collections::{HashMap, HashSet};

use crate::core::event::{ClientId, Event};
use crate::core::sink::Sink;

/// Result of fanning one event out to a member set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Members the sink could not reach
    pub failed: Vec<ClientId>,
}

/// Name -> members relation with a reverse index for cheap client removal
#[derive(Debug)]
pub struct MembershipRouter {
    kind: &'static str,
    members: HashMap<String, HashSet<ClientId>>,
    memberships: HashMap<ClientId, HashSet<String>>,
}

impl MembershipRouter {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            members: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    /// Returns true when the client was not yet a member
    pub fn add(&mut self, client_id: &str, name: &str) -> bool {
        let added = self
            .members
            .entry(name.to_string())
            .or_default()
            .insert(client_id.to_string());
        self.memberships
            .entry(client_id.to_string())
            .or_default()
            .insert(name.to_string());
        if added {
            info!("Client {} added to {} {}", client_id, self.kind, name);
        }
        added
    }

    pub fn remove(&mut self, client_id: &str, name: &str) -> bool {
        let removed = match self.members.get_mut(name) {
            Some(set) => {
                let removed = set.remove(client_id);
                if set.is_empty() {
                    self.members.remove(name);
                }
                removed
            }
            None => false,
        };
        if let Some(names) = self.memberships.get_mut(client_id) {
            names.remove(name);
            if names.is_empty() {
                self.memberships.remove(client_id);
            }
        }
        if removed {
            info!("Client {} removed from {} {}", client_id, self.kind, name);
        }
        removed
    }

    /// Deliver `event` to every current member.
    ///
    /// The member set is copied first: a failed send may disconnect a client
    /// and mutate the very set being walked.
    pub fn broadcast<S: Sink + ?Sized>(
        &self,
        name: &str,
        event: &Event,
        sink: &mut S,
    ) -> BroadcastOutcome {
        let snapshot = self.members(name);
        let mut outcome = BroadcastOutcome::default();
        for client_id in snapshot {
            if sink.send(&client_id, event) {
                outcome.delivered += 1;
            } else {
                outcome.failed.push(client_id);
            }
        }
        debug!(
            "Broadcast to {} {}: {} delivered, {} failed",
            self.kind,
            name,
            outcome.delivered,
            outcome.failed.len()
        );
        outcome
    }

    /// Drop a client from every set it belongs to
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let names = self.memberships.remove(client_id).unwrap_or_default();
        for name in &names {
            if let Some(set) = self.members.get_mut(name) {
                set.remove(client_id);
                if set.is_empty() {
                    self.members.remove(name);
                }
            }
        }
        names.len()
    }

    pub fn members(&self, name: &str) -> Vec<ClientId> {
        self.members
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn memberships(&self, client_id: &str) -> Vec<String> {
        self.memberships
            .get(client_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str, client_id: &str) -> bool {
        self.members
            .get(name)
            .map_or(false, |set| set.contains(client_id))
    }

    /// (name, member count) pairs sorted by name
    pub fn summary(&self) -> Vec<(String, usize)> {
        let mut summary: Vec<(String, usize)> = self
            .members
            .iter()
            .map(|(name, set)| (name.clone(), set.len()))
            .collect();
        summary.sort();
        summary
    }

    /// Number of non-empty sets
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Topic fan-out: everyone interested in a subject
#[derive(Debug)]
pub struct ChannelRouter {
    inner: MembershipRouter,
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self {
            inner: MembershipRouter::new("channel"),
        }
    }

    pub fn subscribe(&mut self, client_id: &str, channel: &str) -> bool {
        self.inner.add(client_id, channel)
    }

    pub fn unsubscribe(&mut self, client_id: &str, channel: &str) -> bool {
        self.inner.remove(client_id, channel)
    }

    pub fn subscribers(&self, channel: &str) -> Vec<ClientId> {
        self.inner.members(channel)
    }

    pub fn router(&self) -> &MembershipRouter {
        &self.inner
    }

    pub fn router_mut(&mut self) -> &mut MembershipRouter {
        &mut self.inner
    }
}

/// Session grouping: everyone currently in a room
#[derive(Debug)]
pub struct RoomRouter {
    inner: MembershipRouter,
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            inner: MembershipRouter::new("room"),
        }
    }

    pub fn join(&mut self, client_id: &str, room_id: &str) -> bool {
        self.inner.add(client_id, room_id)
    }

    pub fn leave(&mut self, client_id: &str, room_id: &str) -> bool {
        self.inner.remove(client_id, room_id)
    }

    pub fn members(&self, room_id: &str) -> Vec<ClientId> {
        self.inner.members(room_id)
    }

    pub fn router(&self) -> &MembershipRouter {
        &self.inner
    }

    pub fn router_mut(&mut self) -> &mut MembershipRouter {
        &mut self.inner
    }
}
