//! Rate limiting in front of every HTTP entry point, plus rejection replies

use log::{error, warn};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::filters::path::FullPath;
use warp::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::core::client_key::{ClientKey, IpExtractionConfig};
use crate::core::event::Identity;
use crate::core::rate_limiter::{MultiTierRateLimiter, RateLimitDecision, RateLimitExceeded};

pub type SharedRateLimiter = Arc<MultiTierRateLimiter>;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Request refused by the rate limiter
#[derive(Debug)]
pub struct RateLimited(pub RateLimitDecision);

impl warp::reject::Reject for RateLimited {}

/// Push connect under an id from the poll namespace
#[derive(Debug)]
pub struct ReservedClientId;

impl warp::reject::Reject for ReservedClientId {}

/// A hub operation failed while serving a request
#[derive(Debug)]
pub struct HubFailure(pub String);

impl warp::reject::Reject for HubFailure {}

impl From<crate::error::HubError> for HubFailure {
    fn from(err: crate::error::HubError) -> Self {
        HubFailure(err.to_string())
    }
}

/// Counts the request against the limiter, rejecting with `RateLimited`
/// when a tier is exhausted. Yields the decision so the reply can carry the
/// rate limit headers. Without a limiter every request passes.
pub fn rate_limit<I>(
    limiter: Option<SharedRateLimiter>,
    ip_config: IpExtractionConfig,
    identity: I,
) -> impl Filter<Extract = (Option<RateLimitDecision>,), Error = Rejection> + Clone
where
    I: Filter<Extract = (Option<Identity>,), Error = Infallible> + Clone + Send + Sync + 'static,
{
    warp::path::full()
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(identity)
        .and_then(
            move |path: FullPath,
                  headers: HeaderMap,
                  remote: Option<SocketAddr>,
                  identity: Option<Identity>| {
                let limiter = limiter.clone();
                let ip_config = ip_config.clone();
                async move {
                    let limiter = match limiter {
                        Some(limiter) => limiter,
                        None => return Ok::<_, Rejection>(None),
                    };
                    let client = ClientKey::resolve(&headers, identity, remote, &ip_config);
                    match limiter.check(&client, path.as_str()).await {
                        Some(decision) if !decision.allowed => {
                            Err(warp::reject::custom(RateLimited(decision)))
                        }
                        decision => Ok(decision),
                    }
                }
            },
        )
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(decision.limit));
    headers.insert(
        HeaderName::from_static(REMAINING_HEADER),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(HeaderName::from_static(RESET_HEADER), HeaderValue::from(decision.reset));
}

/// Attach `X-RateLimit-*` headers to an admitted reply
pub fn with_rate_limit_headers(decision: Option<RateLimitDecision>, reply: Response) -> Response {
    let mut response = reply;
    if let Some(decision) = decision {
        apply_headers(response.headers_mut(), &decision);
    }
    response
}

fn error_reply(status: StatusCode, code: &str, message: &str) -> Response {
    warp::reply::with_status(
        warp::reply::json(&json!({ "error": code, "message": message })),
        status,
    )
    .into_response()
}

/// Turn rejections into JSON error replies
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    if let Some(RateLimited(decision)) = err.find::<RateLimited>() {
        let mut response = warp::reply::with_status(
            warp::reply::json(&RateLimitExceeded::new(decision.retry_after)),
            StatusCode::TOO_MANY_REQUESTS,
        )
        .into_response();
        apply_headers(response.headers_mut(), decision);
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after));
        return Ok(response);
    }

    if err.is_not_found() {
        return Ok(error_reply(StatusCode::NOT_FOUND, "NOT_FOUND", "Not found"));
    }

    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        warn!("Rejected request body: {}", e);
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "INVALID_BODY",
            "Invalid request body",
        ));
    }

    if err.find::<ReservedClientId>().is_some() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "INVALID_CLIENT_ID",
            "Client id is reserved",
        ));
    }

    if err.find::<warp::reject::InvalidQuery>().is_some() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "INVALID_QUERY",
            "Invalid query string",
        ));
    }

    if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        return Ok(error_reply(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            "Request body too large",
        ));
    }

    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(error_reply(
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            "Method not allowed",
        ));
    }

    if let Some(HubFailure(message)) = err.find::<HubFailure>() {
        error!("Request failed: {}", message);
        return Ok(error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error",
        ));
    }

    // Remaining warp rejections (missing headers, failed upgrades) are client errors
    warn!("Rejected request: {:?}", err);
    Ok(error_reply(StatusCode::BAD_REQUEST, "BAD_REQUEST", "Bad request"))
}
