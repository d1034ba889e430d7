//! Process-local LRU cache tier
//!
//! A fixed-capacity, least-recently-used tier holding deserialized payloads
//! for sub-millisecond lookups. Entries carry their own TTL; expiry is
//! checked lazily on access against the injected clock.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tracing::warn;

use super::key::CacheKey;
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct LocalEntry {
    payload: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Bounded LRU tier of the response cache
///
/// Insertion beyond capacity evicts the least-recently-accessed entry; that
/// pressure is expected and silent. Never authoritative: the distributed
/// tier owns durability.
pub struct LocalTier<C: Clock = SystemClock> {
    entries: Arc<Mutex<LruCache<CacheKey, LocalEntry>>>,
    clock: Arc<C>,
}

impl<C: Clock> LocalTier<C> {
    /// Create a tier with the given capacity and clock
    pub fn with_clock(capacity: NonZeroUsize, clock: C) -> Self {
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            clock: Arc::new(clock),
        }
    }

    /// Look up a payload, touching LRU order on hit
    ///
    /// Expired entries are removed and reported as misses.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now();
        let mut entries = self.lock();

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Insert a payload, returning `true` if an entry was evicted to make room
    pub fn insert(&self, key: CacheKey, payload: Value, ttl: Duration) -> bool {
        let entry = LocalEntry { payload, inserted_at: self.clock.now(), ttl };
        let mut entries = self.lock();
        let at_capacity = entries.len() == entries.cap().get() && !entries.contains(&key);
        entries.put(key, entry);
        at_capacity
    }

    /// Whether a live entry exists without touching LRU order
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.lock().peek(key).map(|e| !e.is_expired(now)).unwrap_or(false)
    }

    /// Remove an entry if present
    pub fn remove(&self, key: &CacheKey) {
        self.lock().pop(key);
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of resident entries (including not-yet-collected expired ones)
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, LocalEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("local cache tier lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<C: Clock> Clone for LocalTier<C> {
    fn clone(&self) -> Self {
        Self { entries: Arc::clone(&self.entries), clock: Arc::clone(&self.clock) }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::key::derive_key;
    use crate::clock::MockClock;

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let tier = LocalTier::with_clock(capacity(10), MockClock::new());
        let key = derive_key("/items/1", Vec::<(&str, &str)>::new());

        tier.insert(key.clone(), json!({"id": 1}), Duration::from_secs(60));
        assert_eq!(tier.get(&key), Some(json!({"id": 1})));
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let clock = MockClock::new();
        let tier = LocalTier::with_clock(capacity(10), clock.clone());
        let key = derive_key("/items/1", Vec::<(&str, &str)>::new());

        tier.insert(key.clone(), json!(1), Duration::from_secs(10));
        clock.advance_secs(11);

        assert_eq!(tier.get(&key), None);
        assert_eq!(tier.len(), 0, "expired entry should be collected on access");
    }

    #[test]
    fn test_lru_bound_holds() {
        let tier = LocalTier::with_clock(capacity(3), MockClock::new());

        for i in 0..4 {
            let key = derive_key("/items", vec![("id", i.to_string().as_str())]);
            tier.insert(key, json!(i), Duration::from_secs(60));
        }

        assert_eq!(tier.len(), 3);
        // Oldest key evicted
        let first = derive_key("/items", vec![("id", "0")]);
        assert_eq!(tier.get(&first), None);
    }

    #[test]
    fn test_access_refreshes_lru_order() {
        let tier = LocalTier::with_clock(capacity(2), MockClock::new());
        let a = derive_key("/a", Vec::<(&str, &str)>::new());
        let b = derive_key("/b", Vec::<(&str, &str)>::new());
        let c = derive_key("/c", Vec::<(&str, &str)>::new());

        tier.insert(a.clone(), json!("a"), Duration::from_secs(60));
        tier.insert(b.clone(), json!("b"), Duration::from_secs(60));
        let _ = tier.get(&a);
        tier.insert(c.clone(), json!("c"), Duration::from_secs(60));

        assert!(tier.get(&a).is_some(), "recently accessed entry survives");
        assert!(tier.get(&b).is_none(), "least recently accessed entry evicted");
        assert!(tier.get(&c).is_some());
    }

    #[test]
    fn test_insert_reports_eviction() {
        let tier = LocalTier::with_clock(capacity(1), MockClock::new());
        let a = derive_key("/a", Vec::<(&str, &str)>::new());
        let b = derive_key("/b", Vec::<(&str, &str)>::new());

        assert!(!tier.insert(a.clone(), json!(1), Duration::from_secs(60)));
        assert!(tier.insert(b, json!(2), Duration::from_secs(60)));
        // Overwriting a resident key is not an eviction
        let c = derive_key("/b", Vec::<(&str, &str)>::new());
        assert!(!tier.insert(c, json!(3), Duration::from_secs(60)));
    }

    #[test]
    fn test_remove_and_clear() {
        let tier = LocalTier::with_clock(capacity(10), MockClock::new());
        let key = derive_key("/items/1", Vec::<(&str, &str)>::new());

        tier.insert(key.clone(), json!(1), Duration::from_secs(60));
        tier.remove(&key);
        assert!(tier.is_empty());

        tier.insert(key, json!(1), Duration::from_secs(60));
        tier.clear();
        assert!(tier.is_empty());
    }

    #[test]
    fn test_contains_respects_ttl() {
        let clock = MockClock::new();
        let tier = LocalTier::with_clock(capacity(10), clock.clone());
        let key = derive_key("/items/1", Vec::<(&str, &str)>::new());

        tier.insert(key.clone(), json!(1), Duration::from_secs(10));
        assert!(tier.contains(&key));

        clock.advance_secs(11);
        assert!(!tier.contains(&key));
    }
}
