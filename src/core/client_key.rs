//! Rate limit key derivation
//!
//! A request is attributed to its API key when it carries one, otherwise to
//! the authenticated identity, otherwise to the client address. Proxy headers
//! are only honored when the direct peer is a trusted proxy, so a client
//! cannot pick its own bucket by spoofing `X-Forwarded-For`.

use log::{debug, warn};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use warp::http::HeaderMap;

use crate::constants::API_KEY_HEADER;
use crate::core::event::Identity;

const API_KEY_PREFIX_LEN: usize = 10;

/// Configuration for client address extraction
#[derive(Debug, Clone, Default)]
pub struct IpExtractionConfig {
    /// Whether to read X-Forwarded-For / X-Real-IP at all
    pub trust_proxy_headers: bool,
    /// Peers allowed to set those headers
    pub trusted_proxies: Vec<IpAddr>,
}

impl IpExtractionConfig {
    pub fn behind_proxies(trusted_proxies: Vec<IpAddr>) -> Self {
        Self {
            trust_proxy_headers: !trusted_proxies.is_empty(),
            trusted_proxies,
        }
    }

    fn trusts(&self, peer: IpAddr) -> bool {
        self.trust_proxy_headers && self.trusted_proxies.contains(&peer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// First characters of the presented API key
    ApiKey(String),
    User(Identity),
    Address(Option<IpAddr>),
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKey::ApiKey(prefix) => write!(f, "api:{}", prefix),
            ClientKey::User(identity) => write!(f, "user:{}", identity),
            ClientKey::Address(Some(ip)) => write!(f, "ip:{}", ip),
            ClientKey::Address(None) => write!(f, "ip:unknown"),
        }
    }
}

impl ClientKey {
    pub fn resolve(
        headers: &HeaderMap,
        identity: Option<Identity>,
        remote_addr: Option<SocketAddr>,
        config: &IpExtractionConfig,
    ) -> Self {
        let api_key = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|key| !key.is_empty());
        if let Some(api_key) = api_key {
            return ClientKey::ApiKey(api_key.chars().take(API_KEY_PREFIX_LEN).collect());
        }
        if let Some(identity) = identity {
            return ClientKey::User(identity);
        }
        ClientKey::Address(extract_client_ip(headers, remote_addr, config))
    }
}

/// Address of the client that originated the request
pub fn extract_client_ip(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    config: &IpExtractionConfig,
) -> Option<IpAddr> {
    let direct_ip = remote_addr.map(|addr| addr.ip());

    match direct_ip {
        Some(peer) if config.trusts(peer) => {}
        _ => return direct_ip,
    }

    // X-Forwarded-For is "client, proxy1, proxy2"; the leftmost hop is the client
    if let Some(value) = header_str(headers, "x-forwarded-for") {
        let first_hop = value.split(',').next().unwrap_or("").trim();
        match first_hop.parse::<IpAddr>() {
            Ok(ip) => {
                debug!("Extracted IP from X-Forwarded-For: {}", ip);
                return Some(ip);
            }
            Err(_) => warn!("Invalid IP format in X-Forwarded-For header: {}", first_hop),
        }
    }

    if let Some(value) = header_str(headers, "x-real-ip") {
        match value.trim().parse::<IpAddr>() {
            Ok(ip) => {
                debug!("Extracted IP from X-Real-IP: {}", ip);
                return Some(ip);
            }
            Err(_) => warn!("Invalid IP format in X-Real-IP header: {}", value),
        }
    }

    direct_ip
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
