//! Rate limiting, caching, and fault-isolation primitives for fetchguard.
//!
//! This crate holds the building blocks of the resilience layer:
//!
//! - [`limiter`]: a buffered hourly rate limiter whose window state lives in
//!   a shared key-value store, so many worker processes draw against one
//!   request budget and fail open when the store is unreachable.
//! - [`cache`]: a two-tier response cache (bounded in-process LRU backed by
//!   the shared store) keyed by a deterministic request signature.
//! - [`breaker`] and [`retry`]: a per-process circuit breaker and an
//!   exponential backoff policy with jitter and throttle-aware multipliers.
//! - [`store`]: the shared store abstraction plus an in-memory
//!   implementation for tests and single-process deployments.
//! - [`clock`]: time and jitter seams so every timing behavior is
//!   deterministic under test.
//!
//! Composition of these parts into a single fetch path lives in the
//! `fetchguard-client` crate.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod limiter;
pub mod retry;
pub mod store;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use cache::{derive_key, CacheConfig, CacheConfigError, CacheKey, CacheStats, TieredCache};
pub use clock::{Clock, JitterSource, MockClock, NoJitter, SystemClock, ThreadRngJitter};
pub use limiter::{
    HourlyRateLimiter, LimitDecision, RateLimiterConfig, RateLimiterConfigBuilder, UsageStats,
};
pub use retry::{BackoffConfig, BackoffPolicy, FailureKind};
pub use store::{MemoryStore, SharedStore, StoreError, StoreResult};
