//! Guarded access to a quota-limited upstream HTTP API
//!
//! This crate wires the fetchguard-core primitives into one fetch path:
//! check the two-tier cache, gate on the shared hourly quota, gate on the
//! circuit breaker, then dispatch with retries and exponential backoff.
//! Callers interact with [`Orchestrator`] (single fetches) and
//! [`BatchRunner`] (bulk jobs that log and continue past per-item
//! failures).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fetchguard_client::{ApiRequest, FetchOptions, HttpTransport, Orchestrator, OrchestratorConfig};
//! use fetchguard_core::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::builder("https://api.example.com")
//!     .auth_token("secret")
//!     .build()?;
//! let store = Arc::new(MemoryStore::new());
//! let orchestrator = Orchestrator::new(transport, store, OrchestratorConfig::default())?;
//!
//! let request = ApiRequest::new("/people/").param("id", "42");
//! let fetched = orchestrator.fetch(&request, &FetchOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod batch;
pub mod error;
pub mod orchestrator;
pub mod transport;

pub use batch::{BatchRunner, BatchSummary};
pub use error::FetchError;
pub use orchestrator::{
    ConfigError, FetchOptions, Fetched, Orchestrator, OrchestratorConfig, QuotaMode,
};
pub use transport::{
    ApiRequest, ApiResponse, HttpTransport, HttpTransportBuilder, Transport, TransportError,
};
