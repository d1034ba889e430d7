//! Error taxonomy for the guarded fetch path

use std::time::SystemTime;

use fetchguard_core::StoreError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by [`Orchestrator::fetch`](crate::Orchestrator::fetch)
///
/// Shared-store unavailability never appears here on its own: the limiter
/// and cache degrade in place and the fetch proceeds. The `Store` variant
/// exists for management operations that talk to the store directly.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The buffered hourly quota is exhausted and the caller chose not to
    /// wait (or the wait timed out)
    #[error("hourly request quota exhausted; window resets at {retry_at:?}")]
    QuotaExceeded { retry_at: SystemTime },

    /// The circuit breaker is open; no network attempt was made
    #[error("circuit breaker is open; upstream presumed unhealthy")]
    CircuitOpen,

    /// Every allowed attempt failed with a retryable error
    #[error("retries exhausted after {attempts} attempts (last status: {last_status:?})")]
    RetriesExhausted { attempts: u32, last_status: Option<u16> },

    /// The upstream rejected the request with a non-retryable client error
    #[error("upstream rejected request with status {status}")]
    Client { status: u16 },

    /// The resource does not exist and the caller did not opt into absence
    #[error("resource not found upstream")]
    NotFound,

    /// Transport-level failure outside the retry loop
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Shared store failure during a management operation
    #[error("shared store error: {0}")]
    Store(#[from] StoreError),
}

impl FetchError {
    /// The HTTP status most relevant to this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::RetriesExhausted { last_status, .. } => *last_status,
            FetchError::Client { status } => Some(*status),
            FetchError::NotFound => Some(404),
            _ => None,
        }
    }
}
