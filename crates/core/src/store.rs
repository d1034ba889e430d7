//! Shared counter/cache store abstraction
//!
//! The quota window, alert cooldown marker, and distributed cache tier all
//! live in an external key-value store shared by every worker process. The
//! store is a collaborator: the only contract this crate relies on is
//! atomic `increment` and TTL'd `set`/`get`, with best-effort availability.
//! Callers must tolerate the store being briefly unreachable (see the
//! fail-open behavior in [`crate::limiter`] and [`crate::cache`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::clock::{Clock, SystemClock};

/// Errors raised by shared store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable or refused the connection
    #[error("shared store is unavailable")]
    Unavailable,

    /// The store accepted the connection but the operation failed
    #[error("shared store operation failed: {message}")]
    Io { message: String },
}

/// Result type for shared store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value store shared across worker processes
///
/// All mutations are single atomic operations; no multi-step transactions
/// are assumed because the backing service may not support them.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Fetch the value for `key`, if present and not expired
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` to `value` with a time-to-live
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment the counter at `key`, returning the new value
    ///
    /// The TTL is applied only when the increment creates the key, so an
    /// active window is never extended by its own traffic.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Remove `key` if present
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Cheap reachability probe used to gate degraded-mode fallbacks
    fn is_available(&self) -> bool;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-process [`SharedStore`] implementation
///
/// Serves single-process deployments and tests. TTL expiry is driven by the
/// injected [`Clock`]; an availability toggle lets tests simulate a store
/// outage without touching the network.
pub struct MemoryStore<C: Clock = SystemClock> {
    entries: Arc<Mutex<HashMap<String, StoredValue>>>,
    available: Arc<AtomicBool>,
    clock: Arc<C>,
}

impl MemoryStore<SystemClock> {
    /// Create a memory store using the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    /// Create a memory store with a custom clock (useful for testing)
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            clock: Arc::new(clock),
        }
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        match self.entries.lock() {
            Ok(guard) => guard.values().filter(|v| v.expires_at > now).count(),
            Err(poisoned) => {
                warn!("memory store lock poisoned in len");
                poisoned.into_inner().values().filter(|v| v.expires_at > now).count()
            }
        }
    }

    /// Whether the store holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredValue>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("memory store lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<C: Clock> Clone for MemoryStore<C> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            available: Arc::clone(&self.available),
            clock: Arc::clone(&self.clock),
        }
    }
}

#[async_trait]
impl<C: Clock> SharedStore for MemoryStore<C> {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.lock_entries();

        match entries.get(key) {
            Some(stored) if stored.expires_at > now => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.lock_entries();
        entries
            .insert(key.to_string(), StoredValue { value: value.to_string(), expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entries = self.lock_entries();

        let next = match entries.get(key) {
            Some(stored) if stored.expires_at > now => {
                stored.value.parse::<u64>().unwrap_or(0) + 1
            }
            _ => 1,
        };

        let expires_at = match entries.get(key) {
            // Preserve the original expiry for an existing counter
            Some(stored) if stored.expires_at > now && next > 1 => stored.expires_at,
            _ => now + ttl,
        };

        entries.insert(key.to_string(), StoredValue { value: next.to_string(), expires_at });
        Ok(next)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        self.lock_entries().remove(key);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}
