//! Control-plane HTTP endpoints: publishing, notifications and statistics

use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use warp::{Filter, Rejection, Reply};

use crate::core::dispatcher::SharedHub;
use crate::core::event::{Event, Identity};
use crate::handlers::rate_limit::HubFailure;
use crate::handlers::with_hub;

// 64 KiB is plenty for a notification payload
const MAX_BODY_BYTES: u64 = 64 * 1024;

fn empty_object() -> Value {
    json!({})
}

fn default_notification_title() -> String {
    "New Notification".to_string()
}

fn default_broadcast_title() -> String {
    "Broadcast Message".to_string()
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub title: String,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(default = "default_notification_title")]
    pub title: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default = "default_priority")]
    pub priority: String,
    pub action_url: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Also publish the notification to these channels
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(default = "default_broadcast_title")]
    pub title: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct AnnouncementRequest {
    pub title: String,
    pub message: String,
    pub channels: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChannelsQuery {
    pub channels: Option<String>,
}

impl ChannelsQuery {
    fn channel_list(&self) -> Vec<String> {
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

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: serde::de::DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn reject(err: crate::error::HubError) -> Rejection {
    warp::reject::custom(HubFailure::from(err))
}

/// All control-plane routes, mounted under `/api/v1/realtime` by the caller.
/// Paths are matched before methods so unknown paths stay 404.
pub fn routes<I>(
    hub: SharedHub,
    identity: I,
) -> impl Filter<Extract = (warp::reply::Response,), Error = Rejection> + Clone
where
    I: Filter<Extract = (Option<Identity>,), Error = Infallible> + Clone + Send + Sync + 'static,
{
    let publish_route = warp::path("publish")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<PublishRequest>())
        .and(identity.clone())
        .and(with_hub(hub.clone()))
        .and_then(publish_to_channel);

    let notify_route = warp::path("notify")
        .and(warp::path("user"))
        .and(warp::path::param::<i64>())
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<NotifyRequest>())
        .and(identity.clone())
        .and(with_hub(hub.clone()))
        .and_then(notify_user);

    let broadcast_route = warp::path("broadcast")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<ChannelsQuery>())
        .and(json_body::<BroadcastRequest>())
        .and(identity)
        .and(with_hub(hub.clone()))
        .and_then(broadcast);

    let announce_route = warp::path("announcements")
        .and(warp::path::end())
        .and(warp::post())
        .and(json_body::<AnnouncementRequest>())
        .and(with_hub(hub.clone()))
        .and_then(announce);

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub(hub.clone()))
        .and_then(stats);

    let connection_stats_route = warp::path("connections")
        .and(warp::path("stats"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub(hub.clone()))
        .and_then(connection_stats);

    let list_channels_route = warp::path("channels")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub(hub.clone()))
        .and_then(list_channels);

    let list_rooms_route = warp::path("rooms")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_hub(hub.clone()))
        .and_then(list_rooms);

    let clear_channel_route = warp::path("channels")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_hub(hub))
        .and_then(clear_channel);

    publish_route
        .or(notify_route)
        .unify()
        .or(broadcast_route)
        .unify()
        .or(announce_route)
        .unify()
        .or(stats_route)
        .unify()
        .or(connection_stats_route)
        .unify()
        .or(list_channels_route)
        .unify()
        .or(list_rooms_route)
        .unify()
        .or(clear_channel_route)
        .unify()
}

fn ok_json(value: &Value) -> warp::reply::Response {
    warp::reply::json(value).into_response()
}

async fn publish_to_channel(
    channel: String,
    request: PublishRequest,
    identity: Option<Identity>,
    hub: SharedHub,
) -> Result<warp::reply::Response, Rejection> {
    let kind = request.kind.as_deref().unwrap_or("message");
    let event = Event::envelope(
        kind,
        "msg",
        Some(&channel),
        json!({
            "content": request.content,
            "title": request.title,
            "user_id": identity,
            "metadata": request.metadata,
        }),
    );
    let event_id = event.id();
    let delivered = hub.publish_to_channel(&channel, &event).map_err(reject)?;
    info!("Published {} to channel {} ({} recipients)", kind, channel, delivered);

    Ok(ok_json(&json!({
        "message": format!("Published to channel {}", channel),
        "delivered_count": delivered,
        "event_id": event_id,
    })))
}

async fn notify_user(
    user_id: i64,
    request: NotifyRequest,
    identity: Option<Identity>,
    hub: SharedHub,
) -> Result<warp::reply::Response, Rejection> {
    let target = Identity(user_id);
    let event = Event::envelope(
        "notification",
        "notif",
        None,
        json!({
            "title": request.title,
            "content": request.content,
            "from_user_id": identity,
            "priority": request.priority,
            "action_url": request.action_url,
            "metadata": request.metadata,
        }),
    );
    let event_id = event.id();
    let delivered = if request.channels.is_empty() {
        hub.notify(target, &event)
    } else {
        hub.notify_with_channels(target, &event, &request.channels)
    }
    .map_err(reject)?;

    let message = if delivered {
        format!("Notification sent to user {}", target)
    } else {
        format!("User {} is not connected", target)
    };
    Ok(ok_json(&json!({
        "message": message,
        "delivered": delivered,
        "event_id": event_id,
    })))
}

async fn broadcast(
    query: ChannelsQuery,
    request: BroadcastRequest,
    identity: Option<Identity>,
    hub: SharedHub,
) -> Result<warp::reply::Response, Rejection> {
    let event = Event::envelope(
        "broadcast",
        "broadcast",
        None,
        json!({
            "title": request.title,
            "content": request.content,
            "from_user_id": identity,
            "metadata": request.metadata,
        }),
    );
    let event_id = event.id();
    let summary = hub.broadcast(&query.channel_list(), &event).map_err(reject)?;

    Ok(ok_json(&json!({
        "message": format!("Broadcasted to {} channels", summary.channels.len()),
        "channels": summary.channels,
        "delivered_count": summary.delivered_count,
        "event_id": event_id,
    })))
}

async fn announce(
    request: AnnouncementRequest,
    hub: SharedHub,
) -> Result<warp::reply::Response, Rejection> {
    let summary = hub
        .broadcast_announcement(&request.title, &request.message, request.channels.as_deref())
        .map_err(reject)?;
    Ok(ok_json(&json!({
        "channels": summary.channels,
        "delivered_count": summary.delivered_count,
    })))
}

async fn stats(hub: SharedHub) -> Result<warp::reply::Response, Rejection> {
    let stats = hub.stats().map_err(reject)?;
    Ok(warp::reply::json(&stats).into_response())
}

async fn connection_stats(hub: SharedHub) -> Result<warp::reply::Response, Rejection> {
    let stats = hub.connection_stats().map_err(reject)?;
    Ok(warp::reply::json(&stats).into_response())
}

async fn list_channels(hub: SharedHub) -> Result<warp::reply::Response, Rejection> {
    let channels = hub.list_channels().map_err(reject)?;
    Ok(ok_json(&json!({ "channels": channels })))
}

async fn list_rooms(hub: SharedHub) -> Result<warp::reply::Response, Rejection> {
    let rooms = hub.list_rooms().map_err(reject)?;
    Ok(ok_json(&json!({ "rooms": rooms })))
}

async fn clear_channel(channel: String, hub: SharedHub) -> Result<warp::reply::Response, Rejection> {
    let cleared = hub.clear_channel(&channel).map_err(reject)?;
    Ok(ok_json(&json!({
        "message": format!("Cleared channel {}", channel),
        "messages_cleared": cleared,
    })))
}
