//! Expiring counters backing the rate limiter
//!
//! Each key holds a count and an expiry. The first increment of a key (or of
//! an expired key) starts a fresh window; later increments only bump the count.

use async_trait::async_trait;
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::clock::{Clock, SystemClock};
use crate::error::Result;

/// Count of a key and the time left in its window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub count: u64,
    pub ttl: Duration,
}

/// Counter storage trait
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one and return the new count.
    /// Missing or expired keys start a new window of length `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot>;

    /// Undo one increment. Never goes below zero.
    async fn decrement(&self, key: &str) -> Result<()>;

    /// Current state of a live key
    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>>;

    /// Drop expired keys, returning how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn snapshot(&self, now: Instant) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count,
            ttl: self.expires_at.saturating_duration_since(now),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-memory implementation of the counter store
pub struct MemoryCounterStore {
    counters: RwLock<HashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.counters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.read().await.is_empty()
    }

    /// Start background purge task
    pub fn start_purge_task(self: Arc<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!("Purged {} expired rate limit counters", purged),
                    Err(e) => error!("Failed to purge expired counters: {}", e),
                }
            }
        });
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterSnapshot> {
        let now = self.clock.now();
        let mut counters = self.counters.write().await;
        let entry = counters.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + window,
        });
        if entry.is_expired(now) {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;
        Ok(entry.snapshot(now))
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        let mut counters = self.counters.write().await;
        if let Some(entry) = counters.get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<CounterSnapshot>> {
        let now = self.clock.now();
        let counters = self.counters.read().await;
        Ok(counters
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.snapshot(now)))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, entry| !entry.is_expired(now));
        Ok(before - counters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    #[tokio::test]
    async fn test_first_increment_sets_window() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryCounterStore::with_clock(clock.clone());
        let window = Duration::from_secs(10);

        let first = store.increment("k", window).await.unwrap();
        assert_eq!(first, CounterSnapshot { count: 1, ttl: window });

        clock.advance(Duration::from_secs(4));
        let second = store.increment("k", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.ttl, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_expired_key_restarts() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryCounterStore::with_clock(clock.clone());
        let window = Duration::from_secs(10);

        store.increment("k", window).await.unwrap();
        store.increment("k", window).await.unwrap();
        clock.advance(window);

        assert_eq!(store.get("k").await.unwrap(), None);
        let restarted = store.increment("k", window).await.unwrap();
        assert_eq!(restarted.count, 1);
        assert_eq!(restarted.ttl, window);
    }

    #[tokio::test]
    async fn test_decrement_saturates() {
        let store = MemoryCounterStore::new();
        store.increment("k", Duration::from_secs(60)).await.unwrap();
        store.decrement("k").await.unwrap();
        store.decrement("k").await.unwrap();
        store.decrement("missing").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().map(|s| s.count), Some(0));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryCounterStore::with_clock(clock.clone());
        store.increment("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("long").await.unwrap().is_some());
    }
}
