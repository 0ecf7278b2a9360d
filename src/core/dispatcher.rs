//! Notification hub: one facade over the registry, routers and mailbox
//!
//! All state lives behind a single mutex so that removing a client is atomic
//! across every index. No method holds the lock across an `.await`; push
//! sends are non-blocking channel writes.

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use uuid::Uuid;
use warp::ws::Message as WsMessage;

use crate::constants::{ANNOUNCEMENT_CHANNELS, DEFAULT_CHANNEL, POLL_CLIENT_PREFIX};
use crate::core::connection::Connection;
use crate::core::event::{ClientId, Event, Identity, TransportKind};
use crate::core::mailbox::Mailbox;
use crate::core::message_types::{ChannelInfo, RoomInfo, ServerMessage};
use crate::core::registry::{Registry, RegistryStats};
use crate::core::router::{BroadcastOutcome, ChannelRouter, RoomRouter};
use crate::core::sink::Sink;
use crate::error::{HubError, Result};

/// Everything the hub mutates, guarded together
#[derive(Default)]
pub struct HubState {
    pub registry: Registry,
    pub channels: ChannelRouter,
    pub rooms: RoomRouter,
    pub mailbox: Mailbox,
    messages_sent: u64,
}

impl HubState {
    fn transport_of(&self, client_id: &str) -> Option<TransportKind> {
        if self.registry.contains(client_id) {
            Some(TransportKind::Push)
        } else if self.mailbox.contains(client_id) {
            Some(TransportKind::Poll)
        } else {
            None
        }
    }

    /// Registry -> channels -> rooms -> mailbox
    fn remove_client(&mut self, client_id: &str) -> bool {
        let mut removed = false;
        if let Some(mut connection) = self.registry.disconnect(client_id) {
            connection.close();
            removed = true;
        }
        let channels = self.channels.router_mut().remove_client(client_id);
        let rooms = self.rooms.router_mut().remove_client(client_id);
        removed |= self.mailbox.remove_client(client_id);
        if removed {
            info!(
                "Client {} removed ({} channels, {} rooms)",
                client_id, channels, rooms
            );
        }
        removed || channels > 0 || rooms > 0
    }

    fn prune(&mut self, outcome: &BroadcastOutcome) {
        for client_id in &outcome.failed {
            debug!("Pruning unreachable client {}", client_id);
            self.remove_client(client_id);
        }
    }

    fn publish_to_channel(&mut self, channel: &str, event: &Event) -> usize {
        let HubState {
            registry,
            channels,
            mailbox,
            ..
        } = self;
        let outcome = channels
            .router()
            .broadcast(channel, event, &mut TransportSink { registry, mailbox });
        self.prune(&outcome);
        self.messages_sent += outcome.delivered as u64;
        outcome.delivered
    }

    fn publish_to_room(&mut self, room_id: &str, event: &Event) -> usize {
        let HubState {
            registry,
            rooms,
            mailbox,
            ..
        } = self;
        let outcome = rooms
            .router()
            .broadcast(room_id, event, &mut TransportSink { registry, mailbox });
        self.prune(&outcome);
        self.messages_sent += outcome.delivered as u64;
        outcome.delivered
    }

    /// Push clients first, then poll clients of the same identity
    fn notify(&mut self, identity: Identity, event: &Event) -> bool {
        let push_clients = self.registry.clients_of(identity);
        let pushed = self.registry.send_to_identity(identity, event);
        // Failed sends only left the registry; finish their cleanup
        for client_id in push_clients {
            if !self.registry.contains(&client_id) {
                self.remove_client(&client_id);
            }
        }
        let queued = self.mailbox.send_to_identity(identity, event);

        self.messages_sent += (pushed + queued) as u64;
        pushed + queued > 0
    }
}

/// Routes each delivery to the transport the client is using
struct TransportSink<'a> {
    registry: &'a mut Registry,
    mailbox: &'a mut Mailbox,
}

impl Sink for TransportSink<'_> {
    fn send(&mut self, client_id: &str, event: &Event) -> bool {
        if self.registry.contains(client_id) {
            self.registry.send_to_client(client_id, event)
        } else {
            self.mailbox.enqueue(client_id, event.clone())
        }
    }
}

/// Control-plane statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubStats {
    pub total_clients: usize,
    pub authenticated_clients: usize,
    pub active_channels: usize,
    pub total_messages_sent: u64,
    pub uptime_seconds: f64,
}

/// Per-transport connection counts with channel and room occupancy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    #[serde(flatten)]
    pub push: RegistryStats,
    pub poll_clients: usize,
    pub channels: Vec<ChannelInfo>,
    pub rooms: Vec<RoomInfo>,
}

/// Result of publishing one event to several channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastSummary {
    pub delivered_count: usize,
    pub channels: Vec<String>,
}

/// Facade delivering to identities, channels and rooms regardless of transport
pub struct NotificationHub {
    state: Mutex<HubState>,
    started_at: Instant,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::with_mailbox_capacity(None)
    }

    /// Cap every poll client's queue at `capacity` pending events
    pub fn with_mailbox_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(HubState {
                mailbox: Mailbox::with_capacity_limit(capacity),
                ..HubState::default()
            }),
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>> {
        Ok(self.state.lock()?)
    }

    /// Register a push client and greet it.
    ///
    /// A client already registered under `client_id` is removed first and its
    /// socket closed. Ids in the poll namespace are refused. Returns the
    /// generation to hand to a `ClientGuard`.
    pub fn connect_push(
        &self,
        client_id: &str,
        identity: Option<Identity>,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> Result<u64> {
        if client_id.starts_with(POLL_CLIENT_PREFIX) {
            return Err(HubError::ValidationError(format!(
                "client id '{}' is reserved",
                client_id
            )));
        }
        let mut state = self.lock()?;
        if state.transport_of(client_id).is_some() {
            warn!("Client id {} reused, dropping previous client", client_id);
            state.remove_client(client_id);
        }

        let connection = Connection::new(client_id.to_string(), identity, sender);
        let generation = connection.generation;
        state.registry.connect(connection);

        let welcome = Event::from_message(&ServerMessage::Connection {
            message: "Connected successfully".to_string(),
            client_id: client_id.to_string(),
            authenticated: identity.is_some(),
        })?;
        if !state.registry.send_to_client(client_id, &welcome) {
            warn!("Client {} went away before the welcome frame", client_id);
        }
        Ok(generation)
    }

    /// Register a poll client with a fresh id and subscribe it to `channels`
    pub fn connect_poll(&self, identity: Option<Identity>, channels: &[String]) -> Result<ClientId> {
        let client_id = format!("{}{}", POLL_CLIENT_PREFIX, Uuid::new_v4().simple());
        let mut state = self.lock()?;
        state.mailbox.register(&client_id, identity);
        for channel in channels {
            state.channels.subscribe(&client_id, channel);
        }
        Ok(client_id)
    }

    /// Remove a client from every index. Safe to call repeatedly.
    pub fn remove_client(&self, client_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove_client(client_id))
    }

    /// Remove only if `client_id` still belongs to the caller: the push client
    /// identified by `generation`, or a poll client when `generation` is `None`
    pub fn remove_client_if_current(&self, client_id: &str, generation: Option<u64>) -> Result<bool> {
        let mut state = self.lock()?;
        let owned = match generation {
            Some(expected) => match state.registry.generation_of(client_id) {
                Some(current) => expected == current,
                None => !state.mailbox.contains(client_id),
            },
            None => state.mailbox.contains(client_id),
        };
        if !owned {
            debug!("Skipping cleanup of replaced client {}", client_id);
            return Ok(false);
        }
        Ok(state.remove_client(client_id))
    }

    /// Generation of the push client currently registered under `client_id`
    pub fn generation_of(&self, client_id: &str) -> Result<Option<u64>> {
        Ok(self.lock()?.registry.generation_of(client_id))
    }

    pub fn is_connected(&self, client_id: &str) -> Result<bool> {
        Ok(self.lock()?.transport_of(client_id).is_some())
    }

    pub fn transport_of(&self, client_id: &str) -> Result<Option<TransportKind>> {
        Ok(self.lock()?.transport_of(client_id))
    }

    /// Subscribe a live client; closed or unknown clients are ignored
    pub fn subscribe(&self, client_id: &str, channel: &str) -> Result<bool> {
        let mut state = self.lock()?;
        if state.transport_of(client_id).is_none() {
            return Ok(false);
        }
        state.channels.subscribe(client_id, channel);
        Ok(true)
    }

    pub fn unsubscribe(&self, client_id: &str, channel: &str) -> Result<bool> {
        Ok(self.lock()?.channels.unsubscribe(client_id, channel))
    }

    pub fn join_room(&self, client_id: &str, room_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        if state.transport_of(client_id).is_none() {
            return Ok(false);
        }
        state.rooms.join(client_id, room_id);
        Ok(true)
    }

    pub fn leave_room(&self, client_id: &str, room_id: &str) -> Result<bool> {
        Ok(self.lock()?.rooms.leave(client_id, room_id))
    }

    /// Deliver to one client over whichever transport it uses
    pub fn send_to_client(&self, client_id: &str, event: &Event) -> Result<bool> {
        let mut state = self.lock()?;
        let delivered = match state.transport_of(client_id) {
            Some(TransportKind::Push) => {
                let sent = state.registry.send_to_client(client_id, event);
                if !sent {
                    state.remove_client(client_id);
                }
                sent
            }
            Some(TransportKind::Poll) => state.mailbox.enqueue(client_id, event.clone()),
            None => false,
        };
        if delivered {
            state.messages_sent += 1;
        }
        Ok(delivered)
    }

    /// Reply helper for the push message loop
    pub fn reply(&self, client_id: &str, message: &ServerMessage) -> Result<bool> {
        self.send_to_client(client_id, &Event::from_message(message)?)
    }

    /// Deliver to every client of `identity` on both transports
    pub fn notify(&self, identity: Identity, event: &Event) -> Result<bool> {
        let delivered = self.lock()?.notify(identity, event);
        if !delivered {
            debug!("Identity {} has no reachable clients", identity);
        }
        Ok(delivered)
    }

    /// `notify`, then also publish to each of `channels`
    pub fn notify_with_channels(
        &self,
        identity: Identity,
        event: &Event,
        channels: &[String],
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let delivered = state.notify(identity, event);
        for channel in channels {
            state.publish_to_channel(channel, event);
        }
        Ok(delivered)
    }

    pub fn publish_to_channel(&self, channel: &str, event: &Event) -> Result<usize> {
        Ok(self.lock()?.publish_to_channel(channel, event))
    }

    pub fn publish_to_room(&self, room_id: &str, event: &Event) -> Result<usize> {
        Ok(self.lock()?.publish_to_room(room_id, event))
    }

    /// Publish to several channels, `general` when none are named
    pub fn broadcast(&self, channels: &[String], event: &Event) -> Result<BroadcastSummary> {
        let channels: Vec<String> = if channels.is_empty() {
            vec![DEFAULT_CHANNEL.to_string()]
        } else {
            channels.to_vec()
        };
        let mut state = self.lock()?;
        let delivered_count = channels
            .iter()
            .map(|channel| state.publish_to_channel(channel, event))
            .sum();
        Ok(BroadcastSummary {
            delivered_count,
            channels,
        })
    }

    /// System announcement, by default to `general` and `announcements`
    pub fn broadcast_announcement(
        &self,
        title: &str,
        message: &str,
        channels: Option<&[String]>,
    ) -> Result<BroadcastSummary> {
        let announcement = Event::new(json!({
            "type": "announcement",
            "title": title,
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "priority": "normal",
        }));
        let targets: Vec<String> = match channels {
            Some(channels) if !channels.is_empty() => channels.to_vec(),
            _ => ANNOUNCEMENT_CHANNELS.iter().map(|c| c.to_string()).collect(),
        };
        self.broadcast(&targets, &announcement)
    }

    /// Take a poll client's pending events
    pub fn drain(&self, client_id: &str) -> Result<Vec<Event>> {
        Ok(self.lock()?.mailbox.drain(client_id))
    }

    /// Record inbound activity from a push client
    pub fn touch(&self, client_id: &str) -> Result<()> {
        self.lock()?.registry.touch(client_id);
        Ok(())
    }

    pub fn stats(&self) -> Result<HubStats> {
        let state = self.lock()?;
        let push = state.registry.stats();
        Ok(HubStats {
            total_clients: push.total_connections + state.mailbox.len(),
            authenticated_clients: push.authenticated_connections
                + state.mailbox.authenticated_count(),
            active_channels: state.channels.router().len(),
            total_messages_sent: state.messages_sent,
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        })
    }

    pub fn connection_stats(&self) -> Result<ConnectionStats> {
        let state = self.lock()?;
        Ok(ConnectionStats {
            push: state.registry.stats(),
            poll_clients: state.mailbox.len(),
            channels: Self::channel_infos(&state),
            rooms: Self::room_infos(&state),
        })
    }

    pub fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(Self::channel_infos(&*self.lock()?))
    }

    pub fn list_rooms(&self) -> Result<Vec<RoomInfo>> {
        Ok(Self::room_infos(&*self.lock()?))
    }

    fn channel_infos(state: &HubState) -> Vec<ChannelInfo> {
        state
            .channels
            .router()
            .summary()
            .into_iter()
            .map(|(name, subscriber_count)| ChannelInfo {
                name,
                subscriber_count,
            })
            .collect()
    }

    fn room_infos(state: &HubState) -> Vec<RoomInfo> {
        state
            .rooms
            .router()
            .summary()
            .into_iter()
            .map(|(room_id, member_count)| RoomInfo {
                room_id,
                member_count,
            })
            .collect()
    }

    /// Discard events queued for the poll subscribers of `channel`.
    ///
    /// Queues are per client, not per channel, so everything pending for
    /// those subscribers goes.
    pub fn clear_channel(&self, channel: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let subscribers = state.channels.subscribers(channel);
        let cleared = state.mailbox.clear(&subscribers);
        info!("Cleared {} pending events for channel {}", cleared, channel);
        Ok(cleared)
    }

    /// Close clients idle for longer than `timeout`
    pub fn reap_idle(&self, timeout: Duration) -> Result<usize> {
        let mut state = self.lock()?;
        let mut stale = state.registry.stale_clients(timeout);
        stale.extend(state.mailbox.stale_clients(timeout));
        for client_id in &stale {
            state.remove_client(client_id);
        }
        if !stale.is_empty() {
            info!("Reaped {} idle clients", stale.len());
        }
        Ok(stale.len())
    }

    /// Start automatic cleanup of idle clients
    pub fn start_reaper_task(self: Arc<Self>, every: Duration, timeout: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_idle(timeout) {
                    error!("Failed to reap idle clients: {}", e);
                }
            }
        });
    }
}

// Shared reference to the hub
pub type SharedHub = Arc<NotificationHub>;

/// Removes its client from the hub when dropped.
///
/// Held by every transport task, so cleanup runs exactly once whether the
/// loop ends by close, error, idle reaping or cancellation.
pub struct ClientGuard {
    hub: SharedHub,
    client_id: ClientId,
    generation: Option<u64>,
}

impl ClientGuard {
    /// Guard for a push client registered under `generation`
    pub fn push(hub: SharedHub, client_id: ClientId, generation: u64) -> Self {
        Self {
            hub,
            client_id,
            generation: Some(generation),
        }
    }

    /// Guard for a poll client
    pub fn poll(hub: SharedHub, client_id: ClientId) -> Self {
        Self {
            hub,
            client_id,
            generation: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        match self
            .hub
            .remove_client_if_current(&self.client_id, self.generation)
        {
            Ok(true) => info!("Client disconnected: {}", self.client_id),
            Ok(false) => debug!("Client {} already cleaned up", self.client_id),
            Err(e) => error!("Failed to clean up client {}: {}", self.client_id, e),
        }
    }
}
