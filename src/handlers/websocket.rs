use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use warp::ws::{Message, WebSocket};

use crate::core::dispatcher::{ClientGuard, SharedHub};
use crate::core::event::{ClientId, Identity};
use crate::core::message_handler::MessageHandler;

// Handle a WebSocket connection
//
// The socket is pinged every `ping_interval`; the client's pong counts as
// activity, so a connected but quiet client is not reaped.
pub async fn handle_ws_client(
    ws: WebSocket,
    client_id: ClientId,
    identity: Option<Identity>,
    hub: SharedHub,
    ping_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn a task to forward messages from our channel to the WebSocket
    tokio::task::spawn(async move {
        let mut rx = rx;
        let mut pings = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            let message = tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = pings.tick() => Message::ping(Vec::new()),
            };
            if let Err(e) = ws_tx.send(message).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        if let Err(e) = ws_tx.close().await {
            debug!("Error closing WebSocket sink: {}", e);
        }
    });

    // Register the client
    let generation = match hub.connect_push(&client_id, identity, tx) {
        Ok(generation) => generation,
        Err(e) => {
            error!("Failed to register client {}: {}", client_id, e);
            return;
        }
    };
    let guard = ClientGuard::push(hub.clone(), client_id.clone(), generation);
    info!(
        "Client connected: {} (authenticated: {})",
        client_id,
        identity.is_some()
    );

    let handler = MessageHandler::new(hub.clone());

    // Handle incoming messages
    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!("WebSocket error for {}: {}", client_id, e);
                break;
            }
        };

        // A newer socket took over this id, or the reaper closed us
        match hub.generation_of(&client_id) {
            Ok(Some(current)) if current == generation => {}
            Ok(_) => {
                debug!("Client {} no longer current, ending read loop", client_id);
                break;
            }
            Err(e) => {
                error!("Failed to check client {}: {}", client_id, e);
                break;
            }
        }

        if msg.is_close() {
            break;
        }
        if let Err(e) = hub.touch(&client_id) {
            warn!("Failed to record activity for {}: {}", client_id, e);
        }

        // Only process text messages
        if let Ok(text) = msg.to_str() {
            if let Err(e) = handler.handle_text(&client_id, identity, text) {
                error!("Error handling message from {}: {}", client_id, e);
            }
        }
    }

    // Client disconnected
    drop(guard);
}
