//! Request handlers for different server endpoints

pub mod control;
pub mod rate_limit;
pub mod sse;
pub mod websocket;

use log::{info, warn};
use std::convert::Infallible;
use std::time::Duration;
use warp::http::HeaderMap;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::config::ServerConfig;
use crate::constants::{
    API_PREFIX, EVENTS_PATH, IDENTITY_HEADER, POLL_CLIENT_PREFIX, WS_CONNECT_PATH, WS_PATH,
};
use crate::core::dispatcher::SharedHub;
use crate::core::event::Identity;
use rate_limit::{
    handle_rejection, rate_limit, with_rate_limit_headers, HubFailure, ReservedClientId,
    SharedRateLimiter,
};
use sse::{open_event_stream, EventsQuery, StreamTiming};

pub use websocket::handle_ws_client;

// Helper function to include the hub in a request
pub fn with_hub(hub: SharedHub) -> impl Filter<Extract = (SharedHub,), Error = Infallible> + Clone {
    warp::any().map(move || hub.clone())
}

/// Identity asserted by the upstream auth layer. Ignored unless `trust` is set.
pub fn with_identity(
    trust: bool,
) -> impl Filter<Extract = (Option<Identity>,), Error = Infallible> + Clone {
    warp::header::headers_cloned().map(move |headers: HeaderMap| {
        if !trust {
            return None;
        }
        let raw = headers.get(IDENTITY_HEADER)?.to_str().ok()?;
        match raw.parse::<Identity>() {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Ignoring identity header: {}", e);
                None
            }
        }
    })
}

/// Client id path segment; ids in the poll namespace are refused
fn push_client_id() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::path::param::<String>().and_then(|client_id: String| async move {
        if client_id.starts_with(POLL_CLIENT_PREFIX) {
            return Err(warp::reject::custom(ReservedClientId));
        }
        Ok(client_id)
    })
}

/// `GET /ws/connect/{client_id}`
pub fn websocket_route<I>(
    hub: SharedHub,
    identity: I,
    ping_interval: Duration,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone
where
    I: Filter<Extract = (Option<Identity>,), Error = Infallible> + Clone + Send + Sync + 'static,
{
    warp::path(WS_PATH)
        .and(warp::path(WS_CONNECT_PATH))
        .and(push_client_id())
        .and(warp::path::end())
        .and(warp::ws())
        .and(identity)
        .and(with_hub(hub))
        .map(
            move |client_id: String, ws: warp::ws::Ws, identity: Option<Identity>, hub: SharedHub| {
                info!("New websocket connection for {}", client_id);
                ws.on_upgrade(move |socket| {
                    handle_ws_client(socket, client_id, identity, hub, ping_interval)
                })
                .into_response()
            },
        )
}

/// `GET /events?channels=a,b`
pub fn events_route<I>(
    hub: SharedHub,
    identity: I,
    timing: StreamTiming,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone
where
    I: Filter<Extract = (Option<Identity>,), Error = Infallible> + Clone + Send + Sync + 'static,
{
    warp::path(EVENTS_PATH)
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<EventsQuery>())
        .and(identity)
        .and(with_hub(hub))
        .and_then(move |query: EventsQuery, identity: Option<Identity>, hub: SharedHub| async move {
            let stream = open_event_stream(hub, identity, query.channel_list(), timing)
                .map_err(|e| warp::reject::custom(HubFailure::from(e)))?;
            Ok::<_, Rejection>(warp::sse::reply(stream).into_response())
        })
}

/// Every route of the server, rate limited, with rejections turned into JSON replies
pub fn routes(
    hub: SharedHub,
    limiter: Option<SharedRateLimiter>,
    config: &ServerConfig,
) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let identity = with_identity(config.trust_identity_header);
    let timing = StreamTiming {
        poll_interval: config.poll_interval,
        heartbeat_interval: config.heartbeat_interval,
    };

    let ws = websocket_route(hub.clone(), identity.clone(), config.ping_interval);
    let events = events_route(hub.clone(), identity.clone(), timing);
    let api = warp::path(API_PREFIX[0])
        .and(warp::path(API_PREFIX[1]))
        .and(warp::path(API_PREFIX[2]))
        .and(control::routes(hub, identity.clone()));

    // Create health check route
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "OK".into_response());

    // Errors are turned into replies inside the limited branch so that they
    // carry the rate limit headers too
    let app = ws
        .or(events)
        .unify()
        .or(api)
        .unify()
        .or(health)
        .unify()
        .recover(handle_rejection)
        .unify();

    rate_limit(limiter, config.ip_extraction(), identity)
        .and(app)
        .map(with_rate_limit_headers)
        .recover(handle_rejection)
        .unify()
}
