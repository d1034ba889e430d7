//! Per-target circuit breaker
//!
//! Fault-isolation state machine that stops sending requests to a failing
//! upstream for a cooldown period. After the configured number of
//! consecutive failures the circuit opens and calls are rejected without
//! network I/O; once the cooldown lapses a single probe is let through, and
//! its outcome decides between closing the circuit and restarting the
//! cooldown.
//!
//! Deliberately process-local: horizontally scaled workers each track their
//! own view of upstream health rather than coordinating through the shared
//! store. Simpler, and a store outage cannot take fault detection with it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};

/// Configuration errors for the circuit breaker
#[derive(Debug, Error)]
pub enum BreakerConfigError {
    #[error("invalid circuit breaker configuration: {message}")]
    Invalid { message: String },
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls are rejected without a network attempt
    Open,
    /// One probe call is allowed through to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time to wait before allowing a recovery probe
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::from_secs(60) }
    }
}

impl BreakerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }
        if self.cooldown.is_zero() {
            return Err(BreakerConfigError::Invalid {
                message: "cooldown must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Point-in-time view of the breaker for status reporting
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// How long the circuit has been open, when it is
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for one logical upstream target
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    clock: Arc<C>,
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker using the system clock
    pub fn new(config: BreakerConfig) -> Result<Self, BreakerConfigError> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(config: BreakerConfig, clock: C) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
            clock: Arc::new(clock),
        })
    }

    /// Whether a call may be attempted right now
    ///
    /// Transitions Open → HalfOpen when the cooldown has lapsed; in
    /// half-open only the single probe is admitted.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    debug!("circuit half-open; admitting recovery probe");
                    true
                } else {
                    false
                }
            }
            // The probe is in flight; hold further calls until it resolves
            CircuitState::HalfOpen => false,
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a well-formed reply that carries no health signal
    ///
    /// A 4xx response proves the upstream is reachable without saying the
    /// call succeeded. An outstanding probe is resolved by closing the
    /// circuit; a closed circuit's failure count is left as is, so a 404
    /// between genuine failures neither helps nor hurts the tally.
    pub fn record_reachable(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!("circuit closed; upstream reachable");
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!("recovery probe failed; circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state as last observed; the open-to-half-open transition
    /// only happens inside [`can_execute`](Self::can_execute)
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded so far
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Snapshot for status reporting
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: inner.opened_at.map(|at| now.duration_since(at)),
        }
    }

    /// Force the circuit back to closed
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        info!("circuit manually reset to closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("circuit breaker lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}
