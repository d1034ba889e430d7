//! Failure classification and backoff policy
//!
//! Classifies upstream failures into retryable and fatal kinds and computes
//! exponential backoff delays with jitter. Throttling responses (HTTP 429)
//! get a more conservative multiplier than generic errors, and an upstream
//! `retry-after` hint is honored whenever it exceeds the computed delay.

use std::time::Duration;

use thiserror::Error;

use crate::clock::JitterSource;

/// How an upstream failure should be treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Upstream throttled the request (HTTP 429)
    RateLimited { retry_after: Option<Duration> },
    /// Upstream server error (5xx)
    Server { status: u16 },
    /// Transport-level failure: timeout, connect error, protocol error
    Network,
    /// The requested resource does not exist (HTTP 404)
    NotFound,
    /// Any other client error (4xx); retrying cannot succeed
    Client { status: u16 },
}

impl FailureKind {
    /// Classify an HTTP status code
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => FailureKind::RateLimited { retry_after },
            404 => FailureKind::NotFound,
            400..=499 => FailureKind::Client { status },
            _ => FailureKind::Server { status },
        }
    }

    /// Whether a retry can possibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::RateLimited { .. } | FailureKind::Server { .. } | FailureKind::Network => {
                true
            }
            FailureKind::NotFound | FailureKind::Client { .. } => false,
        }
    }

    /// The HTTP status associated with this failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            FailureKind::RateLimited { .. } => Some(429),
            FailureKind::Server { status } | FailureKind::Client { status } => Some(*status),
            FailureKind::NotFound => Some(404),
            FailureKind::Network => None,
        }
    }
}

/// Configuration errors for the backoff policy
#[derive(Debug, Error)]
pub enum BackoffConfigError {
    #[error("invalid backoff configuration: {message}")]
    Invalid { message: String },
}

/// Configuration for retry/backoff behavior
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum attempts per logical request (first try included)
    pub max_attempts: u32,
    /// Base delay before exponential growth
    pub base: Duration,
    /// Cap applied to the exponential term
    pub cap: Duration,
    /// Upper bound on added jitter
    pub jitter_ceiling: Duration,
    /// Extra multiplier applied when the upstream throttles us
    pub throttle_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
            cap: Duration::from_secs(60),
            jitter_ceiling: Duration::from_millis(1000),
            throttle_multiplier: 1.5,
        }
    }
}

impl BackoffConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackoffConfigError> {
        if self.max_attempts == 0 {
            return Err(BackoffConfigError::Invalid {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }
        if self.base.is_zero() {
            return Err(BackoffConfigError::Invalid {
                message: "base must be greater than zero".to_string(),
            });
        }
        if self.throttle_multiplier < 1.0 {
            return Err(BackoffConfigError::Invalid {
                message: "throttle_multiplier must be at least 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Backoff policy: turns (attempt, failure kind) into a delay
pub struct BackoffPolicy<J: JitterSource> {
    config: BackoffConfig,
    jitter: J,
}

impl<J: JitterSource> BackoffPolicy<J> {
    /// Create a policy with the given jitter source
    pub fn new(config: BackoffConfig, jitter: J) -> Result<Self, BackoffConfigError> {
        config.validate()?;
        Ok(Self { config, jitter })
    }

    /// Maximum attempts per logical request
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Compute the delay before retrying `attempt` (1-based) after `kind`
    ///
    /// `min(base × 2^min(attempt, 6) × multiplier, cap)` plus uniform jitter
    /// bounded by the jitter ceiling. A `retry-after` hint larger than the
    /// computed delay wins.
    pub fn delay_for(&self, attempt: u32, kind: &FailureKind) -> Duration {
        let exponent = attempt.min(6);
        let multiplier = match kind {
            FailureKind::RateLimited { .. } => self.config.throttle_multiplier,
            _ => 1.0,
        };

        let base_ms = self.config.base.as_millis() as f64;
        let exp_ms = base_ms * f64::from(1u32 << exponent) * multiplier;
        let capped = Duration::from_millis(exp_ms.min(self.config.cap.as_millis() as f64) as u64);

        let mut delay = capped + self.jitter.jitter(self.config.jitter_ceiling);

        if let FailureKind::RateLimited { retry_after: Some(hint) } = kind {
            if *hint > delay {
                delay = *hint;
            }
        }

        delay
    }
}
