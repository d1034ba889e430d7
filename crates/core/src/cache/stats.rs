//! Cache statistics tracking
//!
//! Running counters for observability dashboards. Process-local and
//! resettable; no persistence requirement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Snapshot of cache performance counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Hits served from the in-process LRU tier
    pub local_hits: u64,
    /// Hits served from the distributed tier (and backfilled locally)
    pub shared_hits: u64,
    /// Lookups that missed both tiers
    pub misses: u64,
    /// Write-through operations
    pub writes: u64,
    /// Entries evicted from the local tier under capacity pressure
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups served from either tier
    pub fn hit_rate(&self) -> f64 {
        let total = self.local_hits + self.shared_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.local_hits + self.shared_hits) as f64 / total as f64
        }
    }
}

/// Lock-free collector behind the public stats snapshot
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    local_hits: Arc<AtomicU64>,
    shared_hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl Clone for StatsCollector {
    fn clone(&self) -> Self {
        Self {
            local_hits: Arc::clone(&self.local_hits),
            shared_hits: Arc::clone(&self.shared_hits),
            misses: Arc::clone(&self.misses),
            writes: Arc::clone(&self.writes),
            evictions: Arc::clone(&self.evictions),
        }
    }
}

impl StatsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shared_hit(&self) {
        self.shared_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.local_hits.store(0, Ordering::Relaxed);
        self.shared_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}
