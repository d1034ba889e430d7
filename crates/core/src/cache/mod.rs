//! Two-tier response cache
//!
//! Caches upstream responses in a fast, bounded, process-local LRU tier
//! backed by the shared distributed store. The local tier is disposable; the
//! distributed tier (when reachable) is the durable source. Distributed-tier
//! failures are logged and swallowed so a store outage degrades to
//! miss-always rather than failing callers.

mod key;
mod local;
mod stats;
mod tiered;

use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

pub use key::{derive_key, CacheKey};
pub use local::LocalTier;
pub use stats::CacheStats;
pub use tiered::TieredCache;

/// Invalid cache configuration
#[derive(Debug, Error)]
pub enum CacheConfigError {
    #[error("invalid cache configuration: {message}")]
    Invalid { message: String },
}

/// Configuration for the two-tier response cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the local LRU tier
    pub local_capacity: NonZeroUsize,
    /// Default time-to-live applied when the caller does not override it
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
            default_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CacheConfig {
    /// Create a configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }
}

/// Builder for [`CacheConfig`]
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    local_capacity: Option<usize>,
    default_ttl: Option<Duration>,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = Some(capacity);
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<CacheConfig, CacheConfigError> {
        let defaults = CacheConfig::default();
        let capacity = self.local_capacity.unwrap_or(defaults.local_capacity.get());
        let local_capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            CacheConfigError::Invalid {
                message: "local_capacity must be greater than 0".to_string(),
            }
        })?;

        let default_ttl = self.default_ttl.unwrap_or(defaults.default_ttl);
        if default_ttl.is_zero() {
            return Err(CacheConfigError::Invalid {
                message: "default_ttl must be greater than zero".to_string(),
            });
        }

        Ok(CacheConfig { local_capacity, default_ttl })
    }
}
