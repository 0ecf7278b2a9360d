//! Handles inbound push-transport frames and routes them through the hub

use log::{debug, info, warn};
use serde_json::Value;

use crate::core::dispatcher::SharedHub;
use crate::core::event::{Event, Identity};
use crate::core::message_types::{ClientMessage, FrameError, ServerMessage};
use crate::error::{HubError, Result};

/// Handles incoming client messages and routes them appropriately
pub struct MessageHandler {
    hub: SharedHub,
}

impl MessageHandler {
    pub fn new(hub: SharedHub) -> Self {
        Self { hub }
    }

    /// Parse one text frame and act on it. Bad frames get an `error` reply
    /// and never close the connection.
    pub fn handle_text(&self, client_id: &str, identity: Option<Identity>, text: &str) -> Result<()> {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(client_id, identity, message),
            Err(e) => {
                warn!("Rejected frame from {}: {}", client_id, e.client_message());
                self.reply_error(client_id, e.client_message())
            }
        }
    }

    pub fn handle_message(
        &self,
        client_id: &str,
        identity: Option<Identity>,
        message: ClientMessage,
    ) -> Result<()> {
        match message {
            ClientMessage::Ping { timestamp } => {
                self.hub.reply(client_id, &ServerMessage::Pong { timestamp })?;
            }

            ClientMessage::Subscribe { channel } => {
                if channel.is_empty() {
                    return self.reply_invalid(client_id, "subscribe");
                }
                self.hub.subscribe(client_id, &channel)?;
                let message = format!("Subscribed to {}", channel);
                self.hub
                    .reply(client_id, &ServerMessage::Subscribed { channel, message })?;
            }

            ClientMessage::Unsubscribe { channel } => {
                if channel.is_empty() {
                    return self.reply_invalid(client_id, "unsubscribe");
                }
                self.hub.unsubscribe(client_id, &channel)?;
                let message = format!("Unsubscribed from {}", channel);
                self.hub
                    .reply(client_id, &ServerMessage::Unsubscribed { channel, message })?;
            }

            ClientMessage::JoinRoom { room_id } => {
                if room_id.is_empty() {
                    return self.reply_invalid(client_id, "join_room");
                }
                self.hub.join_room(client_id, &room_id)?;
                let message = format!("Joined room {}", room_id);
                self.hub
                    .reply(client_id, &ServerMessage::JoinedRoom { room_id, message })?;
            }

            ClientMessage::LeaveRoom { room_id } => {
                if room_id.is_empty() {
                    return self.reply_invalid(client_id, "leave_room");
                }
                self.hub.leave_room(client_id, &room_id)?;
                let message = format!("Left room {}", room_id);
                self.hub
                    .reply(client_id, &ServerMessage::LeftRoom { room_id, message })?;
            }

            ClientMessage::Broadcast {
                channel,
                content,
                timestamp,
            } => {
                let Some(user_id) = identity else {
                    return self.reply_auth_required(client_id, "broadcasting");
                };
                let event = Event::from_message(&ServerMessage::Broadcast {
                    channel: channel.clone(),
                    user_id,
                    content,
                    timestamp,
                })?;
                let delivered = self.hub.publish_to_channel(&channel, &event)?;
                debug!("{} broadcast to {} ({} recipients)", client_id, channel, delivered);
            }

            ClientMessage::PrivateMessage {
                target_user_id,
                content,
                timestamp,
            } => {
                let Some(from_user_id) = identity else {
                    return self.reply_auth_required(client_id, "private messages");
                };
                self.send_private(client_id, from_user_id, target_user_id, content, timestamp)?;
            }

            ClientMessage::RoomMessage {
                room_id,
                content,
                timestamp,
            } => {
                let Some(user_id) = identity else {
                    return self.reply_auth_required(client_id, "room messages");
                };
                let event = Event::from_message(&ServerMessage::RoomMessage {
                    room_id: room_id.clone(),
                    user_id,
                    content,
                    timestamp,
                })?;
                let delivered = self.hub.publish_to_room(&room_id, &event)?;
                debug!("{} messaged room {} ({} recipients)", client_id, room_id, delivered);
            }

            // `parse` never yields this; a hand-built message still gets an answer
            ClientMessage::Unknown => {
                self.reply_error(client_id, FrameError::UnknownType("unknown".to_string()).client_message())?;
            }
        }
        Ok(())
    }

    fn send_private(
        &self,
        client_id: &str,
        from_user_id: Identity,
        target: Identity,
        content: Value,
        timestamp: Option<Value>,
    ) -> Result<()> {
        let event = Event::from_message(&ServerMessage::PrivateMessage {
            from_user_id,
            content,
            timestamp,
        })?;
        if self.hub.notify(target, &event)? {
            info!("Private message from {} delivered to user {}", from_user_id, target);
            self.hub.reply(
                client_id,
                &ServerMessage::MessageSent {
                    message: "Private message sent successfully".to_string(),
                },
            )?;
            Ok(())
        } else {
            self.reply_error(client_id, "Target user not connected".to_string())
        }
    }

    fn reply_error(&self, client_id: &str, message: String) -> Result<()> {
        self.hub.reply(client_id, &ServerMessage::error(message))?;
        Ok(())
    }

    fn reply_invalid(&self, client_id: &str, kind: &str) -> Result<()> {
        self.reply_error(
            client_id,
            FrameError::InvalidFields(kind.to_string()).client_message(),
        )
    }

    fn reply_auth_required(&self, client_id: &str, action: &str) -> Result<()> {
        let err = HubError::AuthenticationRequired(action.to_string());
        debug!("Anonymous client {} refused: {}", client_id, err);
        self.reply_error(client_id, err.to_string())
    }
}
