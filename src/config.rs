//! Server configuration module
//! Reads `REALTIME_HUB_*` environment variables, falling back to the defaults in `constants`

use crate::constants::{
    DEFAULT_BURST_LIMIT, DEFAULT_HEARTBEAT_SECS, DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_PING_INTERVAL_SECS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PORT,
    DEFAULT_RATE_LIMIT_PER_MINUTE, DEFAULT_REAPER_INTERVAL_SECS,
};
use crate::core::client_key::IpExtractionConfig;
use crate::core::rate_limiter::RateLimitConfig;
use crate::error::{HubError, Result};
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between `heartbeat` events on event streams
    pub heartbeat_interval: Duration,
    /// How often an event stream drains its mailbox
    pub poll_interval: Duration,
    /// Interval between server pings on push sockets; kept below `idle_timeout`
    pub ping_interval: Duration,
    /// Clients silent for longer than this are reaped
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub counter_purge_interval: Duration,
    /// Per-client cap on queued poll events; unbounded when `None`
    pub mailbox_capacity: Option<usize>,
    /// Accept the identity header set by the upstream auth layer
    pub trust_identity_header: bool,
    /// Peers whose X-Forwarded-For / X-Real-IP headers are believed
    pub trusted_proxies: Vec<IpAddr>,
    pub rate_limiting_enabled: bool,
    pub rate_limit_per_minute: u64,
    /// Burst tier limit; zero disables the tier
    pub burst_limit: u64,
    /// TLS configuration
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            counter_purge_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            mailbox_capacity: None,
            trust_identity_header: false,
            trusted_proxies: Vec::new(),
            rate_limiting_enabled: true,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            burst_limit: DEFAULT_BURST_LIMIT,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

impl ServerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let parse = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
                    HubError::ConfigError(format!("{} must be a non-negative integer, got '{}'", key, raw))
                }),
                None => Ok(None),
            }
        };
        let flag = |key: &str, default: bool| lookup(key).map(|v| parse_flag(&v)).unwrap_or(default);

        let host = lookup("REALTIME_HUB_HOST").unwrap_or(defaults.host);
        let port = match lookup("REALTIME_HUB_PORT") {
            Some(raw) => u16::from_str(raw.trim()).map_err(|_| {
                HubError::ConfigError(format!("REALTIME_HUB_PORT is not a valid port: '{}'", raw))
            })?,
            None => defaults.port,
        };

        let heartbeat_interval = parse("REALTIME_HUB_HEARTBEAT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);
        let poll_interval = parse("REALTIME_HUB_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);
        let ping_interval = parse("REALTIME_HUB_PING_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.ping_interval);
        let idle_timeout = parse("REALTIME_HUB_IDLE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);
        let reaper_interval = parse("REALTIME_HUB_REAPER_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.reaper_interval);
        let counter_purge_interval = parse("REALTIME_HUB_COUNTER_PURGE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.counter_purge_interval);

        // Zero means unbounded
        let mailbox_capacity = parse("REALTIME_HUB_MAILBOX_CAPACITY")?
            .filter(|capacity| *capacity > 0)
            .map(|capacity| capacity as usize);

        let trust_identity_header = flag("REALTIME_HUB_TRUST_IDENTITY_HEADER", false);

        let trusted_proxies = match lookup("REALTIME_HUB_TRUSTED_PROXIES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| {
                    entry.parse::<IpAddr>().map_err(|_| {
                        HubError::ConfigError(format!("Invalid trusted proxy address: '{}'", entry))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let rate_limiting_enabled = flag("REALTIME_HUB_RATE_LIMIT_ENABLED", true);
        let rate_limit_per_minute =
            parse("REALTIME_HUB_RATE_LIMIT_PER_MINUTE")?.unwrap_or(defaults.rate_limit_per_minute);
        let burst_limit = parse("REALTIME_HUB_RATE_LIMIT_BURST")?.unwrap_or(defaults.burst_limit);

        // TLS configuration
        let enable_tls = flag("REALTIME_HUB_ENABLE_TLS", false);
        let tls_cert_path = lookup("REALTIME_HUB_TLS_CERT_PATH");
        let tls_key_path = lookup("REALTIME_HUB_TLS_KEY_PATH");

        let config = Self {
            host,
            port,
            heartbeat_interval,
            poll_interval,
            ping_interval,
            idle_timeout,
            reaper_interval,
            counter_purge_interval,
            mailbox_capacity,
            trust_identity_header,
            trusted_proxies,
            rate_limiting_enabled,
            rate_limit_per_minute,
            burst_limit,
            enable_tls,
            tls_cert_path,
            tls_key_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(HubError::ConfigError(
                "Heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(HubError::ConfigError(
                "Poll interval must be greater than zero".to_string(),
            ));
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.idle_timeout {
            return Err(HubError::ConfigError(
                "Ping interval must be greater than zero and shorter than the idle timeout"
                    .to_string(),
            ));
        }
        if self.reaper_interval.is_zero() || self.counter_purge_interval.is_zero() {
            return Err(HubError::ConfigError(
                "Background task intervals must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting_enabled && self.rate_limit_per_minute == 0 {
            return Err(HubError::ConfigError(
                "REALTIME_HUB_RATE_LIMIT_PER_MINUTE must be positive when rate limiting is enabled"
                    .to_string(),
            ));
        }

        // Validate TLS configuration if enabled
        if self.enable_tls {
            let (cert_path, key_path) = match (&self.tls_cert_path, &self.tls_key_path) {
                (Some(cert), Some(key)) => (cert, key),
                _ => {
                    return Err(HubError::ConfigError(
                        "TLS is enabled but REALTIME_HUB_TLS_CERT_PATH or REALTIME_HUB_TLS_KEY_PATH is not set"
                            .to_string(),
                    ))
                }
            };
            if !std::path::Path::new(cert_path).exists() {
                return Err(HubError::ConfigError(format!(
                    "TLS certificate file does not exist: {}",
                    cert_path
                )));
            }
            if !std::path::Path::new(key_path).exists() {
                return Err(HubError::ConfigError(format!(
                    "TLS private key file does not exist: {}",
                    key_path
                )));
            }
        }
        Ok(())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.rate_limit_per_minute, Some(self.burst_limit))
    }

    pub fn ip_extraction(&self) -> IpExtractionConfig {
        IpExtractionConfig::behind_proxies(self.trusted_proxies.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.ping_interval < config.idle_timeout);
        assert!(!config.trust_identity_header);
        assert!(config.rate_limiting_enabled);
        assert_eq!(config.mailbox_capacity, None);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("REALTIME_HUB_PORT", "8080"),
            ("REALTIME_HUB_TRUST_IDENTITY_HEADER", "true"),
            ("REALTIME_HUB_TRUSTED_PROXIES", "10.0.0.1, ::1"),
            ("REALTIME_HUB_MAILBOX_CAPACITY", "50"),
            ("REALTIME_HUB_RATE_LIMIT_BURST", "0"),
        ]))
        .unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.trust_identity_header);
        assert_eq!(config.trusted_proxies.len(), 2);
        assert_eq!(config.mailbox_capacity, Some(50));

        let names: Vec<_> = config
            .rate_limit_config()
            .tiers
            .into_iter()
            .map(|tier| tier.name)
            .collect();
        assert_eq!(names, ["1m", "1h"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("REALTIME_HUB_PORT", "http")])).unwrap_err();
        assert!(matches!(err, HubError::ConfigError(_)));

        let err =
            ServerConfig::from_lookup(lookup(&[("REALTIME_HUB_POLL_INTERVAL_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("Poll interval"));

        let err = ServerConfig::from_lookup(lookup(&[("REALTIME_HUB_TRUSTED_PROXIES", "nope")]))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_ping_interval_must_undercut_idle_timeout() {
        let err = ServerConfig::from_lookup(lookup(&[
            ("REALTIME_HUB_PING_INTERVAL_SECS", "300"),
            ("REALTIME_HUB_IDLE_TIMEOUT_SECS", "300"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("Ping interval"));

        let config = ServerConfig::from_lookup(lookup(&[
            ("REALTIME_HUB_PING_INTERVAL_SECS", "20"),
            ("REALTIME_HUB_IDLE_TIMEOUT_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_tls_requires_paths() {
        let err = ServerConfig::from_lookup(lookup(&[("REALTIME_HUB_ENABLE_TLS", "1")])).unwrap_err();
        assert!(err.to_string().contains("TLS"));
    }
}
