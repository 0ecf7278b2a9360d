//! Multi-tier fixed-window rate limiting
//!
//! Every request is counted against each global tier (burst, per-minute,
//! per-hour) and, for selected endpoints, against a per-endpoint tier. Counts
//! live in a [`CounterStore`] and are incremented before being compared, so
//! concurrent requests cannot both slip under a limit. An over-limit
//! increment is rolled back so blocked requests do not extend the penalty.

use log::{debug, error, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BURST_LIMIT, DEFAULT_BURST_WINDOW_SECS, DEFAULT_RATE_LIMIT_PER_MINUTE,
};
use crate::core::client_key::ClientKey;
use crate::core::clock::{Clock, SystemClock};
use crate::error::HubError;
use crate::storage::counter_store::{CounterSnapshot, CounterStore};

/// One fixed window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitTier {
    pub name: String,
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitTier {
    pub fn new(name: impl Into<String>, limit: u64, window_secs: u64) -> Self {
        Self {
            name: name.into(),
            limit,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// Stricter limits for specific endpoints, matched by path prefix
#[derive(Debug, Clone, Default)]
pub struct EndpointLimits {
    limits: Vec<(String, RateLimitTier)>,
}

impl EndpointLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits for the sensitive endpoints of the surrounding API
    pub fn standard() -> Self {
        let mut limits = Self::new();
        limits.insert("/api/v1/auth/login", 5, 300);
        limits.insert("/api/v1/auth/register", 3, 3600);
        limits.insert("/api/v1/auth/reset-password", 3, 3600);
        limits.insert("/api/v1/uploads/file", 10, 60);
        limits.insert("/api/v1/uploads/multiple", 5, 60);
        limits.insert("/api/v1/courses", 100, 60);
        limits.insert("/api/v1/users", 50, 60);
        limits.insert("/api/v1/ws/connect", 5, 60);
        limits.insert("/ws/connect", 5, 60);
        limits
    }

    pub fn insert(&mut self, path: &str, limit: u64, window_secs: u64) {
        self.limits.retain(|(existing, _)| existing != path);
        self.limits
            .push((path.to_string(), RateLimitTier::new(path, limit, window_secs)));
    }

    /// Longest configured prefix of `path`, on segment boundaries
    pub fn get(&self, path: &str) -> Option<&RateLimitTier> {
        self.limits
            .iter()
            .filter(|(prefix, _)| {
                path == prefix
                    || (path.starts_with(prefix.as_str())
                        && path[prefix.len()..].starts_with('/'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, tier)| tier)
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub tiers: Vec<RateLimitTier>,
    pub endpoint_limits: EndpointLimits,
    pub exclude_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_PER_MINUTE, Some(DEFAULT_BURST_LIMIT))
    }
}

impl RateLimitConfig {
    /// Burst tier (optional), per-minute tier and per-hour tier at 60x the minute rate
    pub fn new(calls_per_minute: u64, burst_limit: Option<u64>) -> Self {
        let mut tiers = Vec::with_capacity(3);
        if let Some(burst) = burst_limit.filter(|limit| *limit > 0) {
            tiers.push(RateLimitTier::new("10s", burst, DEFAULT_BURST_WINDOW_SECS));
        }
        tiers.push(RateLimitTier::new("1m", calls_per_minute, 60));
        tiers.push(RateLimitTier::new("1h", calls_per_minute.saturating_mul(60), 3600));
        Self::with_tiers(tiers)
    }

    pub fn with_tiers(mut tiers: Vec<RateLimitTier>) -> Self {
        tiers.sort_by_key(|tier| tier.window);
        Self {
            tiers,
            endpoint_limits: EndpointLimits::standard(),
            exclude_paths: vec![
                "/health".to_string(),
                "/docs".to_string(),
                "/openapi.json".to_string(),
            ],
        }
    }

    pub fn with_endpoint_limits(mut self, endpoint_limits: EndpointLimits) -> Self {
        self.endpoint_limits = endpoint_limits;
        self
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths.iter().any(|excluded| excluded == path)
    }
}

/// Outcome of one admission check, carrying what goes in the response headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tier: String,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the reported window resets
    pub reset: u64,
    /// Seconds until a blocked client may retry; zero when allowed
    pub retry_after: u64,
}

/// Body of a 429 reply
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitExceeded {
    pub error: &'static str,
    pub message: &'static str,
    pub retry_after: u64,
}

impl RateLimitExceeded {
    pub fn new(retry_after: u64) -> Self {
        Self {
            error: "RATE_LIMIT_EXCEEDED",
            message: "Too many requests",
            retry_after,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub checked_requests: u64,
    pub blocked_requests: u64,
    pub store_failures: u64,
}

pub struct MultiTierRateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    checked_requests: AtomicU64,
    blocked_requests: AtomicU64,
    store_failures: AtomicU64,
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl MultiTierRateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            checked_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            store_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request. `None` when the path is not rate limited.
    pub async fn check(&self, client: &ClientKey, path: &str) -> Option<RateLimitDecision> {
        if self.config.is_excluded(path) {
            return None;
        }
        self.checked_requests.fetch_add(1, Ordering::Relaxed);

        let mut checks: Vec<(String, &RateLimitTier)> = self
            .config
            .tiers
            .iter()
            .map(|tier| (format!("rate_limit:{}:{}", tier.name, client), tier))
            .collect();
        if let Some(tier) = self.config.endpoint_limits.get(path) {
            checks.push((format!("endpoint:{}:{}", tier.name, client), tier));
        }

        // (remaining, window, decision) of the tightest tier seen so far
        let mut tightest: Option<(u64, Duration, RateLimitDecision)> = None;

        for (key, tier) in checks {
            let snapshot = match self.store.increment(&key, tier.window).await {
                Ok(snapshot) => snapshot,
                Err(e) => return Some(self.fail_open(tier, &e)),
            };

            if snapshot.count > tier.limit {
                self.rollback(&key).await;
                return Some(self.blocked(client, tier, snapshot));
            }

            let remaining = tier.limit - snapshot.count;
            let tighter = match &tightest {
                Some((best_remaining, best_window, _)) => {
                    (remaining, tier.window) < (*best_remaining, *best_window)
                }
                None => true,
            };
            if tighter {
                let decision = RateLimitDecision {
                    allowed: true,
                    tier: tier.name.clone(),
                    limit: tier.limit,
                    remaining,
                    reset: self.clock.unix_now() + ceil_secs(snapshot.ttl),
                    retry_after: 0,
                };
                tightest = Some((remaining, tier.window, decision));
            }
        }

        tightest.map(|(_, _, decision)| decision)
    }

    async fn rollback(&self, key: &str) {
        if let Err(e) = self.store.decrement(key).await {
            self.store_failures.fetch_add(1, Ordering::Relaxed);
            error!("Failed to roll back rate limit counter {}: {}", key, e);
        }
    }

    fn blocked(
        &self,
        client: &ClientKey,
        tier: &RateLimitTier,
        snapshot: CounterSnapshot,
    ) -> RateLimitDecision {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        let retry_after = ceil_secs(snapshot.ttl).max(1);
        warn!(
            "Rate limit exceeded for {} on tier {} ({}/{}), retry in {}s",
            client, tier.name, tier.limit, tier.window.as_secs(), retry_after
        );
        RateLimitDecision {
            allowed: false,
            tier: tier.name.clone(),
            limit: tier.limit,
            remaining: 0,
            reset: self.clock.unix_now() + retry_after,
            retry_after,
        }
    }

    fn fail_open(&self, tier: &RateLimitTier, e: &HubError) -> RateLimitDecision {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        error!("Rate limit store failure on tier {}, admitting request: {}", tier.name, e);
        debug!("Store failures so far: {}", self.store_failures.load(Ordering::Relaxed));
        RateLimitDecision {
            allowed: true,
            tier: tier.name.clone(),
            limit: tier.limit,
            remaining: tier.limit,
            reset: self.clock.unix_now() + tier.window.as_secs(),
            retry_after: 0,
        }
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            checked_requests: self.checked_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::event::Identity;
    use crate::error::Result;
    use crate::storage::counter_store::MemoryCounterStore;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<CounterSnapshot> {
            Err(HubError::StoreUnavailable)
        }
        async fn decrement(&self, _key: &str) -> Result<()> {
            Err(HubError::StoreUnavailable)
        }
        async fn get(&self, _key: &str) -> Result<Option<CounterSnapshot>> {
            Err(HubError::StoreUnavailable)
        }
        async fn purge_expired(&self) -> Result<usize> {
            Err(HubError::StoreUnavailable)
        }
    }

    fn limiter(tiers: Vec<RateLimitTier>, clock: Arc<ManualClock>) -> MultiTierRateLimiter {
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        MultiTierRateLimiter::with_clock(RateLimitConfig::with_tiers(tiers), store, clock)
    }

    #[test]
    fn test_hourly_tier_saturates() {
        let config = RateLimitConfig::new(u64::MAX, None);
        let hourly = config.tiers.iter().find(|tier| tier.name == "1h").unwrap();
        assert_eq!(hourly.limit, u64::MAX);

        let config = RateLimitConfig::new(60, None);
        let hourly = config.tiers.iter().find(|tier| tier.name == "1h").unwrap();
        assert_eq!(hourly.limit, 3600);
    }

    #[tokio::test]
    async fn test_fixed_window_blocks_and_resets() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(vec![RateLimitTier::new("10s", 5, 10)], clock.clone());
        let client = ClientKey::User(Identity(1));

        for expected in [4, 3, 2, 1, 0] {
            let decision = limiter.check(&client, "/events").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.limit, 5);
        }

        let blocked = limiter.check(&client, "/events").await.unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, 0);
        assert!(blocked.retry_after > 0);

        clock.advance(Duration::from_secs(10));
        let decision = limiter.check(&client, "/events").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_blocked_requests_are_rolled_back() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let limiter = MultiTierRateLimiter::with_clock(
            RateLimitConfig::with_tiers(vec![RateLimitTier::new("1m", 2, 60)]),
            store.clone(),
            clock,
        );
        let client = ClientKey::Address(None);

        for _ in 0..5 {
            limiter.check(&client, "/events").await;
        }
        let counter = store.get("rate_limit:1m:ip:unknown").await.unwrap().unwrap();
        assert_eq!(counter.count, 2);
        assert_eq!(limiter.stats().blocked_requests, 3);
    }

    #[tokio::test]
    async fn test_most_restrictive_tier_reported() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(
            vec![RateLimitTier::new("1m", 3, 60), RateLimitTier::new("10s", 10, 10)],
            clock,
        );
        let client = ClientKey::ApiKey("abc".to_string());

        let decision = limiter.check(&client, "/events").await.unwrap();
        assert_eq!(decision.tier, "1m");
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_clients_are_counted_separately() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(vec![RateLimitTier::new("10s", 1, 10)], clock);

        let a = ClientKey::User(Identity(1));
        let b = ClientKey::User(Identity(2));
        assert!(limiter.check(&a, "/x").await.unwrap().allowed);
        assert!(!limiter.check(&a, "/x").await.unwrap().allowed);
        assert!(limiter.check(&b, "/x").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_endpoint_limit_applies_by_prefix() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(vec![RateLimitTier::new("1m", 100, 60)], clock);
        let client = ClientKey::Address(Some("203.0.113.5".parse().unwrap()));

        for _ in 0..5 {
            assert!(limiter.check(&client, "/ws/connect/a").await.unwrap().allowed);
        }
        let blocked = limiter.check(&client, "/ws/connect/b").await.unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.tier, "/ws/connect");
        assert!(limiter.check(&client, "/events").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_excluded_paths_are_not_counted() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(vec![RateLimitTier::new("1m", 1, 60)], clock);
        let client = ClientKey::Address(None);

        assert!(limiter.check(&client, "/health").await.is_none());
        assert!(limiter.check(&client, "/health").await.is_none());
        assert!(limiter.check(&client, "/events").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = MultiTierRateLimiter::new(RateLimitConfig::default(), Arc::new(BrokenStore));
        let decision = limiter
            .check(&ClientKey::Address(None), "/events")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(limiter.store_failures(), 1);
    }

    #[test]
    fn test_endpoint_prefix_matching() {
        let limits = EndpointLimits::standard();
        assert_eq!(limits.get("/api/v1/auth/login").map(|t| t.limit), Some(5));
        assert_eq!(limits.get("/ws/connect/client-1").map(|t| t.limit), Some(5));
        assert!(limits.get("/api/v1/usersettings").is_none());
        assert!(limits.get("/events").is_none());
    }

    #[test]
    fn test_default_tiers_sorted_by_window() {
        let config = RateLimitConfig::default();
        let names: Vec<_> = config.tiers.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["10s", "1m", "1h"]);
        assert_eq!(config.tiers[2].limit, DEFAULT_RATE_LIMIT_PER_MINUTE * 60);
    }
}
