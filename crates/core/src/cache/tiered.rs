//! Two-tier cache composition
//!
//! Lookups check the local LRU tier first, then the distributed store,
//! backfilling the local tier on a distributed hit. Writes go through to
//! both tiers. Every distributed-tier failure is logged and swallowed: a
//! store outage must degrade to cache-miss-always, never fail the caller.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::local::LocalTier;
use super::stats::{CacheStats, StatsCollector};
use super::CacheConfig;
use crate::clock::{Clock, SystemClock};
use crate::store::SharedStore;

// Wire form of a distributed-tier entry. The expiry travels with the
// payload so a backfilled local copy cannot outlive the distributed entry
// it was copied from, whatever TTL the writing process chose.
#[derive(Debug, Serialize, Deserialize)]
struct SharedEntry {
    payload: Value,
    /// Absolute expiry, seconds since the UNIX epoch
    expires_at: u64,
}

/// Two-tier response cache keyed by request signature
pub struct TieredCache<S: SharedStore, C: Clock = SystemClock> {
    local: LocalTier<C>,
    store: Arc<S>,
    config: CacheConfig,
    stats: StatsCollector,
    clock: Arc<C>,
}

impl<S: SharedStore> TieredCache<S, SystemClock> {
    /// Create a cache over the given store using the system clock
    pub fn new(config: CacheConfig, store: Arc<S>) -> Self {
        Self::with_clock(config, store, SystemClock)
    }
}

impl<S: SharedStore, C: Clock + Clone> TieredCache<S, C> {
    /// Create a cache with a custom clock (useful for testing)
    pub fn with_clock(config: CacheConfig, store: Arc<S>, clock: C) -> Self {
        Self {
            local: LocalTier::with_clock(config.local_capacity, clock.clone()),
            store,
            config,
            stats: StatsCollector::new(),
            clock: Arc::new(clock),
        }
    }

    /// Look up a cached payload
    ///
    /// Local tier first; on a local miss the distributed tier is consulted
    /// and a hit is backfilled into the local tier with the entry's
    /// remaining lifetime before returning.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        if let Some(payload) = self.local.get(key) {
            self.stats.record_local_hit();
            return Some(payload);
        }

        match self.store.get(key.as_str()).await {
            Ok(Some(raw)) => match serde_json::from_str::<SharedEntry>(&raw) {
                Ok(entry) => {
                    let remaining =
                        entry.expires_at.saturating_sub(self.clock.secs_since_epoch());
                    if remaining == 0 {
                        // Present in a store that has not collected it yet
                        self.stats.record_miss();
                        return None;
                    }
                    self.stats.record_shared_hit();
                    let backfill_ttl = Duration::from_secs(remaining);
                    if self.local.insert(key.clone(), entry.payload.clone(), backfill_ttl) {
                        self.stats.record_eviction();
                    }
                    Some(entry.payload)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "discarding undecodable distributed cache entry");
                    self.stats.record_miss();
                    None
                }
            },
            Ok(None) => {
                self.stats.record_miss();
                None
            }
            Err(err) => {
                debug!(key = %key, error = %err, "distributed cache tier unreachable; treating as miss");
                self.stats.record_miss();
                None
            }
        }
    }

    /// Write a payload through to both tiers with the default TTL
    pub async fn set(&self, key: &CacheKey, payload: &Value) {
        self.set_with_ttl(key, payload, self.config.default_ttl).await;
    }

    /// Write a payload through to both tiers with an explicit TTL
    pub async fn set_with_ttl(&self, key: &CacheKey, payload: &Value, ttl: Duration) {
        self.stats.record_write();

        if self.local.insert(key.clone(), payload.clone(), ttl) {
            self.stats.record_eviction();
        }

        if !self.store.is_available() {
            warn!(key = %key, "distributed cache tier unavailable; write is local-only");
            return;
        }

        let entry = SharedEntry {
            payload: payload.clone(),
            expires_at: self.clock.secs_since_epoch() + ttl.as_secs(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key = %key, error = %err, "distributed cache entry not serializable; write is local-only");
                return;
            }
        };
        if let Err(err) = self.store.set(key.as_str(), &raw, ttl).await {
            warn!(key = %key, error = %err, "distributed cache write failed; continuing with local tier");
        }
    }

    /// Whether either tier holds a live entry for the key
    pub async fn has(&self, key: &CacheKey) -> bool {
        if self.local.contains(key) {
            return true;
        }
        matches!(self.store.get(key.as_str()).await, Ok(Some(_)))
    }

    /// Remove the key from both tiers, best-effort on the distributed tier
    pub async fn delete(&self, key: &CacheKey) {
        self.local.remove(key);
        if let Err(err) = self.store.delete(key.as_str()).await {
            warn!(key = %key, error = %err, "distributed cache delete failed");
        }
    }

    /// Drop the entire local tier
    ///
    /// Distributed entries are left to TTL expiry; their capacity bound
    /// belongs to the store's operator.
    pub fn clear_local(&self) {
        self.local.clear();
    }

    /// Snapshot of the running cache counters
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Reset the running counters to zero
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Number of entries resident in the local tier
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

impl<S: SharedStore, C: Clock> Clone for TieredCache<S, C> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            stats: self.stats.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::key::derive_key;
    use crate::clock::MockClock;
    use crate::store::MemoryStore;

    fn cache_with_clock(clock: MockClock) -> (TieredCache<MemoryStore<MockClock>, MockClock>, Arc<MemoryStore<MockClock>>) {
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = CacheConfig::builder()
            .local_capacity(4)
            .default_ttl(Duration::from_secs(3600))
            .build()
            .unwrap();
        (TieredCache::with_clock(config, Arc::clone(&store), clock), store)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (cache, _) = cache_with_clock(MockClock::new());
        let key = derive_key("/items/42", Vec::<(&str, &str)>::new());

        cache.set(&key, &json!({"id": 42})).await;
        assert_eq!(cache.get(&key).await, Some(json!({"id": 42})));

        let stats = cache.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.local_hits, 1);
    }

    #[tokio::test]
    async fn test_distributed_hit_backfills_local() {
        let clock = MockClock::new();
        let (cache, store) = cache_with_clock(clock.clone());
        let key = derive_key("/items/7", Vec::<(&str, &str)>::new());

        // Entry written by another process: only in its local tier + store
        let writer = TieredCache::with_clock(
            CacheConfig::default(),
            Arc::clone(&store),
            clock.clone(),
        );
        writer.set(&key, &json!({"id": 7})).await;

        assert_eq!(cache.get(&key).await, Some(json!({"id": 7})));
        assert_eq!(cache.stats().shared_hits, 1);
        assert_eq!(cache.local_len(), 1, "hit should be backfilled into local tier");

        // Second read served locally
        let _ = cache.get(&key).await;
        assert_eq!(cache.stats().local_hits, 1);
    }

    #[tokio::test]
    async fn test_backfill_honors_remaining_distributed_ttl() {
        let clock = MockClock::new();
        let (cache, store) = cache_with_clock(clock.clone());
        let key = derive_key("/items/9", Vec::<(&str, &str)>::new());

        // Another process cached this with a short 10s TTL; this process's
        // default TTL is much longer.
        let writer = TieredCache::with_clock(
            CacheConfig::default(),
            Arc::clone(&store),
            clock.clone(),
        );
        writer.set_with_ttl(&key, &json!(9), Duration::from_secs(10)).await;

        assert_eq!(cache.get(&key).await, Some(json!(9)), "backfill on shared hit");

        // Past the writer's TTL the local copy must be gone too, even
        // though it is still within this cache's default TTL.
        clock.advance_secs(11);
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_in_both_tiers() {
        let clock = MockClock::new();
        let (cache, _) = cache_with_clock(clock.clone());
        let key = derive_key("/items/42", Vec::<(&str, &str)>::new());

        cache.set_with_ttl(&key, &json!(1), Duration::from_secs(1)).await;
        clock.advance(Duration::from_millis(1100));

        assert_eq!(cache.get(&key).await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_miss() {
        let (cache, store) = cache_with_clock(MockClock::new());
        let key = derive_key("/items/42", Vec::<(&str, &str)>::new());

        store.set_available(false);

        // Write does not fail the caller
        cache.set(&key, &json!(1)).await;
        // Local tier still serves it
        assert_eq!(cache.get(&key).await, Some(json!(1)));

        // A key only in the (now unreachable) store reads as a miss
        cache.clear_local();
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_has_and_delete() {
        let (cache, _) = cache_with_clock(MockClock::new());
        let key = derive_key("/items/42", Vec::<(&str, &str)>::new());

        assert!(!cache.has(&key).await);
        cache.set(&key, &json!(1)).await;
        assert!(cache.has(&key).await);

        cache.delete(&key).await;
        assert!(!cache.has(&key).await);
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_undecodable_store_entry_is_a_miss() {
        let (cache, store) = cache_with_clock(MockClock::new());
        let key = derive_key("/items/42", Vec::<(&str, &str)>::new());

        store.set(key.as_str(), "not-json{", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_local_eviction_counted() {
        let (cache, _) = cache_with_clock(MockClock::new());

        for i in 0..5 {
            let key = derive_key("/items", vec![("id", i.to_string().as_str())]);
            cache.set(&key, &json!(i)).await;
        }

        // Capacity is 4, so the fifth write evicted one entry
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.local_len(), 4);
    }
}
