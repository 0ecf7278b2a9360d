//! Event-stream transport for clients that cannot hold a socket
//!
//! Each stream owns a poll client in the hub. Every poll cycle drains the
//! client's mailbox; heartbeats are interleaved on their own timer. Dropping
//! the stream (client went away) drops the `ClientGuard`, which removes the
//! client from the hub.

use futures_util::stream::{self, Stream};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::core::dispatcher::{ClientGuard, SharedHub};
use crate::core::event::{Event, Identity, TransportKind};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated channel names
    pub channels: Option<String>,
}

impl EventsQuery {
    pub fn channel_list(&self) -> Vec<String> {
        self.channels
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|channel| !channel.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Timing of one event stream
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

struct StreamState {
    guard: ClientGuard,
    hub: SharedHub,
    pending: VecDeque<Event>,
    poll: Interval,
    heartbeat: Interval,
}

fn ticker(period: Duration, first_after: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + first_after, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Frame one hub event as `id:` / `event:` / `data:`
pub fn to_sse_event(event: &Event) -> warp::sse::Event {
    let sse = warp::sse::Event::default()
        .event(event.kind())
        .data(event.to_json());
    match event.id() {
        Some(id) => sse.id(id),
        None => sse,
    }
}

/// Register a poll client and return its stream
pub fn open_event_stream(
    hub: SharedHub,
    identity: Option<Identity>,
    channels: Vec<String>,
    timing: StreamTiming,
) -> crate::error::Result<impl Stream<Item = Result<warp::sse::Event, Infallible>>> {
    let client_id = hub.connect_poll(identity, &channels)?;
    info!(
        "Event stream opened: {} (identity: {:?}, channels: {:?})",
        client_id, identity, channels
    );

    let connected = Event::new(json!({
        "type": "connected",
        "message": "Connected to SSE stream",
        "client_id": client_id,
        "channels": channels,
    }));

    let state = StreamState {
        guard: ClientGuard::poll(hub.clone(), client_id),
        hub,
        pending: VecDeque::from(vec![connected]),
        poll: ticker(timing.poll_interval, Duration::ZERO),
        heartbeat: ticker(timing.heartbeat_interval, timing.heartbeat_interval),
    };

    Ok(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(to_sse_event(&event)), state));
            }

            let client_id = state.guard.client_id().to_string();
            tokio::select! {
                _ = state.poll.tick() => {
                    match state.hub.transport_of(&client_id) {
                        Ok(Some(TransportKind::Poll)) => {}
                        Ok(_) => {
                            debug!("Poll client {} was removed, ending stream", client_id);
                            return None;
                        }
                        Err(e) => {
                            error!("Event stream for {} failed: {}", client_id, e);
                            return None;
                        }
                    }
                    match state.hub.drain(&client_id) {
                        Ok(events) => state.pending.extend(events),
                        Err(e) => {
                            error!("Failed to drain mailbox for {}: {}", client_id, e);
                            return None;
                        }
                    }
                }
                _ = state.heartbeat.tick() => {
                    state.pending.push_back(Event::heartbeat(&client_id));
                }
            }
        }
    }))
}
