//! Buffered hourly rate limiter coordinated through the shared store
//!
//! Tracks request counts in a sliding hourly window held in the shared
//! key-value store, so every worker process draws against the same budget.
//! The enforced limit sits below the upstream's real quota (the buffer
//! limit), reserving headroom for manual and out-of-band traffic.
//!
//! The window is a single counter plus a window-start timestamp: a
//! sliding-window approximation with O(1) space and time. A reset at the
//! window boundary can momentarily admit a short burst above the nominal
//! rate; that imprecision is accepted in exchange for keeping the hot path
//! a single atomic increment.
//!
//! If the store is unreachable the limiter fails open: `check_limit`
//! answers `allowed=true` and logs a degraded-tracking warning at most once
//! per alert cooldown. Availability of the ingestion pipeline is preferred
//! over strict quota enforcement during a store outage.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::store::SharedStore;

/// Configuration errors for the rate limiter
#[derive(Debug, Error)]
pub enum LimiterConfigError {
    #[error("invalid rate limiter configuration: {message}")]
    Invalid { message: String },
}

/// Configuration for the hourly rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// The upstream's real hourly request quota
    pub hourly_limit: u64,
    /// Fraction of the real quota this limiter will spend (safety buffer)
    pub buffer_fraction: f64,
    /// Fraction of the buffer limit at which throttle warnings begin
    pub warning_fraction: f64,
    /// Accounting window duration
    pub window: Duration,
    /// Minimum spacing between emitted warnings
    pub alert_cooldown: Duration,
    /// Polling interval for `wait_for_availability`
    pub poll_interval: Duration,
    /// Key prefix in the shared store, one namespace per upstream target
    pub namespace: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 5000,
            buffer_fraction: 0.9,
            warning_fraction: 0.8,
            window: Duration::from_secs(3600),
            alert_cooldown: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(2),
            namespace: "fetchguard".to_string(),
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration builder
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// The enforced request budget: a safety margin below the real quota
    pub fn buffer_limit(&self) -> u64 {
        ((self.hourly_limit as f64) * self.buffer_fraction).floor() as u64
    }

    /// Count at which throttle warnings start
    pub fn warning_threshold(&self) -> u64 {
        ((self.buffer_limit() as f64) * self.warning_fraction).floor() as u64
    }

    /// TTL for window keys: outlives the window so stale windows self-expire
    pub fn window_ttl(&self) -> Duration {
        self.window * 2
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), LimiterConfigError> {
        if self.hourly_limit == 0 {
            return Err(LimiterConfigError::Invalid {
                message: "hourly_limit must be greater than 0".to_string(),
            });
        }
        if !(self.buffer_fraction > 0.0 && self.buffer_fraction <= 1.0) {
            return Err(LimiterConfigError::Invalid {
                message: "buffer_fraction must be in (0, 1]".to_string(),
            });
        }
        if !(self.warning_fraction > 0.0 && self.warning_fraction <= 1.0) {
            return Err(LimiterConfigError::Invalid {
                message: "warning_fraction must be in (0, 1]".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(LimiterConfigError::Invalid {
                message: "window must be greater than zero".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(LimiterConfigError::Invalid {
                message: "poll_interval must be greater than zero".to_string(),
            });
        }
        if self.namespace.is_empty() {
            return Err(LimiterConfigError::Invalid {
                message: "namespace must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`RateLimiterConfig`]
#[derive(Debug)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl Default for RateLimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn hourly_limit(mut self, limit: u64) -> Self {
        self.config.hourly_limit = limit;
        self
    }

    pub fn buffer_fraction(mut self, fraction: f64) -> Self {
        self.config.buffer_fraction = fraction;
        self
    }

    pub fn warning_fraction(mut self, fraction: f64) -> Self {
        self.config.warning_fraction = fraction;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn alert_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.alert_cooldown = cooldown;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, LimiterConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Answer to a speculative limit check
#[derive(Debug, Clone)]
pub struct LimitDecision {
    /// Whether a request may proceed right now
    pub allowed: bool,
    /// Requests recorded in the current window
    pub current_count: u64,
    /// Requests left before the buffer limit cuts off
    pub remaining: u64,
    /// The enforced (buffer) limit
    pub limit: u64,
    /// Wall-clock time at which the current window lapses
    pub reset_time: SystemTime,
    /// True when the shared store was unreachable and the limiter failed open
    pub degraded: bool,
}

/// Usage snapshot for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub limit: u64,
    pub remaining: u64,
    pub utilization_percent: f64,
    /// Linear projection of requests per hour at the current pace
    pub projected_hourly_rate: f64,
    /// Window start as seconds since the UNIX epoch, if a window exists
    pub window_started_at: Option<u64>,
}

// Effective view of the persisted window, after lapse handling
struct WindowView {
    count: u64,
    started_at: Option<u64>,
    lapsed: bool,
}

/// Distributed hourly rate limiter
///
/// All cross-process state lives in the shared store under the configured
/// namespace; the only local state is the degraded-warning cooldown marker.
pub struct HourlyRateLimiter<S: SharedStore, C: Clock = SystemClock> {
    config: RateLimiterConfig,
    store: Arc<S>,
    clock: Arc<C>,
    degraded_warned_at: Arc<Mutex<Option<Instant>>>,
}

impl<S: SharedStore> HourlyRateLimiter<S, SystemClock> {
    /// Create a limiter over the given store using the system clock
    pub fn new(config: RateLimiterConfig, store: Arc<S>) -> Result<Self, LimiterConfigError> {
        Self::with_clock(config, store, SystemClock)
    }
}

impl<S: SharedStore, C: Clock> HourlyRateLimiter<S, C> {
    /// Create a limiter with a custom clock (useful for testing)
    pub fn with_clock(
        config: RateLimiterConfig,
        store: Arc<S>,
        clock: C,
    ) -> Result<Self, LimiterConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            clock: Arc::new(clock),
            degraded_warned_at: Arc::new(Mutex::new(None)),
        })
    }

    fn count_key(&self) -> String {
        format!("{}:quota:count", self.config.namespace)
    }

    fn window_key(&self) -> String {
        format!("{}:quota:window_start", self.config.namespace)
    }

    fn alert_key(&self) -> String {
        format!("{}:quota:last_alert", self.config.namespace)
    }

    /// Check whether a request may proceed
    ///
    /// Never mutates the window; safe to call speculatively. Returns
    /// `allowed=false` once the count reaches the buffer limit. Fails open
    /// with a degraded warning when the store is unreachable.
    pub async fn check_limit(&self) -> LimitDecision {
        let buffer_limit = self.config.buffer_limit();

        let view = match self.read_window().await {
            Some(view) => view,
            None => {
                self.warn_degraded("rate limit tracking degraded; failing open");
                return LimitDecision {
                    allowed: true,
                    current_count: 0,
                    remaining: buffer_limit,
                    limit: buffer_limit,
                    reset_time: self.clock.system_time() + self.config.window,
                    degraded: true,
                };
            }
        };

        let count = if view.lapsed { 0 } else { view.count };
        let reset_time = match view.started_at {
            Some(started) if !view.lapsed => {
                SystemTime::UNIX_EPOCH + Duration::from_secs(started) + self.config.window
            }
            _ => self.clock.system_time() + self.config.window,
        };

        LimitDecision {
            allowed: count < buffer_limit,
            current_count: count,
            remaining: buffer_limit.saturating_sub(count),
            limit: buffer_limit,
            reset_time,
            degraded: false,
        }
    }

    /// Record a dispatched request
    ///
    /// Atomically increments the window counter; called after a call is
    /// actually sent, never for requests rejected by the circuit breaker or
    /// the limiter itself. Crossing the warning threshold emits a throttle
    /// warning at most once per alert cooldown. Returns the count after the
    /// increment (0 when tracking is degraded).
    pub async fn record_request(&self) -> u64 {
        if !self.store.is_available() {
            self.warn_degraded("request not recorded; shared store unavailable");
            return 0;
        }

        let ttl = self.config.window_ttl();
        let now_secs = self.clock.secs_since_epoch();

        let lapsed = match self.read_window().await {
            Some(view) => view.lapsed || view.started_at.is_none(),
            None => {
                self.warn_degraded("request not recorded; shared store unavailable");
                return 0;
            }
        };

        let count = if lapsed {
            // New window. Two TTL'd sets rather than a transaction; a
            // concurrent roller can briefly tear the window at the boundary.
            let started = self.store.set(&self.window_key(), &now_secs.to_string(), ttl).await;
            let reset = self.store.set(&self.count_key(), "1", ttl).await;
            if started.is_err() || reset.is_err() {
                self.warn_degraded("window rollover failed; shared store unavailable");
                return 0;
            }
            debug!(namespace = %self.config.namespace, "rate limit window rolled over");
            1
        } else {
            match self.store.increment(&self.count_key(), ttl).await {
                Ok(count) => count,
                Err(err) => {
                    self.warn_degraded(&format!("request not recorded: {err}"));
                    return 0;
                }
            }
        };

        if count >= self.config.warning_threshold() {
            self.maybe_emit_throttle_warning(count).await;
        }

        count
    }

    /// Suspend until capacity is available, `max_wait` lapses, or `cancel`
    /// fires
    ///
    /// Polls `check_limit` at the configured interval; never busy-spins.
    /// Returns `true` when capacity became available, `false` on timeout or
    /// cancellation — the caller decides whether to proceed anyway or abort.
    pub async fn wait_for_availability(
        &self,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            if self.check_limit().await.allowed {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!(namespace = %self.config.namespace, "gave up waiting for rate limit capacity");
                return false;
            }

            let sleep_for = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(namespace = %self.config.namespace, "wait for capacity cancelled");
                    return false;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Usage snapshot for dashboards
    pub async fn usage_stats(&self) -> UsageStats {
        let buffer_limit = self.config.buffer_limit();
        let view = self.read_window().await.unwrap_or(WindowView {
            count: 0,
            started_at: None,
            lapsed: false,
        });

        let count = if view.lapsed { 0 } else { view.count };
        let started_at = if view.lapsed { None } else { view.started_at };

        let projected = match started_at {
            Some(started) => {
                let elapsed = self.clock.secs_since_epoch().saturating_sub(started).max(1);
                let fraction = elapsed as f64 / self.config.window.as_secs().max(1) as f64;
                count as f64 / fraction
            }
            None => 0.0,
        };

        UsageStats {
            total_requests: count,
            limit: buffer_limit,
            remaining: buffer_limit.saturating_sub(count),
            utilization_percent: if buffer_limit == 0 {
                0.0
            } else {
                count as f64 / buffer_limit as f64 * 100.0
            },
            projected_hourly_rate: projected,
            window_started_at: started_at,
        }
    }

    /// Force the window back to zero
    ///
    /// Administrative escape hatch; idempotent and safe to call
    /// concurrently (last writer wins on the start timestamp).
    pub async fn reset_window(&self) {
        let ttl = self.config.window_ttl();
        let now_secs = self.clock.secs_since_epoch();

        let started = self.store.set(&self.window_key(), &now_secs.to_string(), ttl).await;
        let count = self.store.set(&self.count_key(), "0", ttl).await;

        match (started, count) {
            (Ok(()), Ok(())) => {
                info!(namespace = %self.config.namespace, "rate limit window manually reset")
            }
            _ => self.warn_degraded("window reset failed; shared store unavailable"),
        }
    }

    /// The active configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    // Reads count + window start and decides whether the window has lapsed.
    // Returns None when the store is unreachable.
    async fn read_window(&self) -> Option<WindowView> {
        if !self.store.is_available() {
            return None;
        }

        let started_at = match self.store.get(&self.window_key()).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()),
            Err(_) => return None,
        };

        let count = match self.store.get(&self.count_key()).await {
            Ok(value) => value.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0),
            Err(_) => return None,
        };

        let lapsed = match started_at {
            Some(started) => {
                let elapsed = self.clock.secs_since_epoch().saturating_sub(started);
                elapsed >= self.config.window.as_secs()
            }
            None => true,
        };

        Some(WindowView { count, started_at, lapsed })
    }

    // Emits the approaching-limit warning, gated by the shared cooldown
    // marker so many workers do not all alert at once.
    async fn maybe_emit_throttle_warning(&self, count: u64) {
        let alert_key = self.alert_key();

        match self.store.get(&alert_key).await {
            Ok(Some(_)) => {} // still inside the cooldown
            Ok(None) => {
                let now_secs = self.clock.secs_since_epoch().to_string();
                if self
                    .store
                    .set(&alert_key, &now_secs, self.config.alert_cooldown)
                    .await
                    .is_ok()
                {
                    warn!(
                        namespace = %self.config.namespace,
                        count,
                        buffer_limit = self.config.buffer_limit(),
                        "approaching rate limit buffer"
                    );
                }
            }
            Err(_) => {}
        }
    }

    // Logs a degraded-mode warning at most once per alert cooldown; the
    // marker is deliberately local since the store itself is the problem.
    fn warn_degraded(&self, message: &str) {
        let now = self.clock.now();
        let mut warned_at = match self.degraded_warned_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let should_warn = match *warned_at {
            Some(last) => now.duration_since(last) >= self.config.alert_cooldown,
            None => true,
        };

        if should_warn {
            warn!(namespace = %self.config.namespace, "{message}");
            *warned_at = Some(now);
        }
    }
}

impl<S: SharedStore, C: Clock> Clone for HourlyRateLimiter<S, C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            degraded_warned_at: Arc::clone(&self.degraded_warned_at),
        }
    }
}
