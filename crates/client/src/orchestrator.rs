//! The guarded fetch pipeline
//!
//! [`Orchestrator`] is the single entry point callers use. Every fetch walks
//! the same gauntlet: cache lookup, quota check, circuit gate, then a retry
//! loop with exponential backoff. Each layer degrades rather than aborts
//! where the policy allows it.

use std::sync::Arc;
use std::time::Duration;

use fetchguard_core::breaker::BreakerConfigError;
use fetchguard_core::limiter::LimiterConfigError;
use fetchguard_core::retry::BackoffConfigError;
use fetchguard_core::{
    BackoffConfig, BackoffPolicy, BreakerConfig, BreakerSnapshot, CacheConfig, CacheStats,
    CircuitBreaker, Clock, FailureKind, HourlyRateLimiter, JitterSource, LimitDecision,
    RateLimiterConfig, SharedStore, SystemClock, ThreadRngJitter, TieredCache, UsageStats,
};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::transport::{ApiRequest, Transport};

/// Invalid configuration for one of the pipeline stages
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Limiter(#[from] LimiterConfigError),
    #[error(transparent)]
    Breaker(#[from] BreakerConfigError),
    #[error(transparent)]
    Backoff(#[from] BackoffConfigError),
}

/// Configuration for the whole pipeline; each stage validates its own part
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub limiter: RateLimiterConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub backoff: BackoffConfig,
}

/// What to do when the hourly quota is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaMode {
    /// Fail immediately with [`FetchError::QuotaExceeded`]
    Fail,
    /// Block up to the given duration for capacity to free up
    Wait(Duration),
}

/// Per-call knobs for [`Orchestrator::fetch`]
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Treat an upstream 404 as [`Fetched::Absent`] instead of an error
    pub allow_not_found: bool,
    pub quota: QuotaMode,
    /// Override the cache TTL for this response
    pub cache_ttl: Option<Duration>,
    /// Aborts quota waits and backoff sleeps when fired
    pub cancel: CancellationToken,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allow_not_found: false,
            quota: QuotaMode::Fail,
            cache_ttl: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_not_found(mut self) -> Self {
        self.allow_not_found = true;
        self
    }

    pub fn wait_for_quota(mut self, max_wait: Duration) -> Self {
        self.quota = QuotaMode::Wait(max_wait);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Outcome of a successful guarded fetch
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// Served from the cache (either tier); no upstream request was made
    Hit(Value),
    /// Fetched from upstream and written through to the cache
    Fresh(Value),
    /// The resource does not exist and the caller opted into absence
    Absent,
}

impl Fetched {
    /// The response payload, unless the resource is absent
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Fetched::Hit(value) | Fetched::Fresh(value) => Some(value),
            Fetched::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Fetched::Absent)
    }
}

/// Guarded fetch pipeline over a quota-limited upstream
pub struct Orchestrator<T, S, C = SystemClock, J = ThreadRngJitter>
where
    T: Transport,
    S: SharedStore,
    C: Clock,
    J: JitterSource,
{
    transport: T,
    limiter: HourlyRateLimiter<S, Arc<C>>,
    cache: TieredCache<S, Arc<C>>,
    breaker: CircuitBreaker<Arc<C>>,
    backoff: BackoffPolicy<J>,
}

impl<T: Transport, S: SharedStore> Orchestrator<T, S, SystemClock, ThreadRngJitter> {
    /// Build a pipeline with the system clock and thread-local jitter
    pub fn new(transport: T, store: Arc<S>, config: OrchestratorConfig) -> Result<Self, ConfigError> {
        Self::with_parts(transport, store, config, SystemClock, ThreadRngJitter)
    }
}

impl<T, S, C, J> Orchestrator<T, S, C, J>
where
    T: Transport,
    S: SharedStore,
    C: Clock,
    J: JitterSource,
{
    /// Build a pipeline with explicit clock and jitter seams (for tests)
    pub fn with_parts(
        transport: T,
        store: Arc<S>,
        config: OrchestratorConfig,
        clock: C,
        jitter: J,
    ) -> Result<Self, ConfigError> {
        let clock = Arc::new(clock);
        let limiter =
            HourlyRateLimiter::with_clock(config.limiter, Arc::clone(&store), Arc::clone(&clock))?;
        let cache = TieredCache::with_clock(config.cache, store, Arc::clone(&clock));
        let breaker = CircuitBreaker::with_clock(config.breaker, clock)?;
        let backoff = BackoffPolicy::new(config.backoff, jitter)?;

        Ok(Self { transport, limiter, cache, breaker, backoff })
    }

    /// Fetch a response through the full resilience pipeline
    ///
    /// A cache hit on either tier short-circuits before any limiter or
    /// breaker interaction. On a miss the quota gate runs first (it is the
    /// cheaper refusal), then the circuit gate, then the retry loop. Every
    /// dispatched network attempt is recorded against the quota, including
    /// failed ones.
    pub async fn fetch(
        &self,
        request: &ApiRequest,
        options: &FetchOptions,
    ) -> Result<Fetched, FetchError> {
        let key = request.cache_key();

        if let Some(payload) = self.cache.get(&key).await {
            debug!(endpoint = %request.endpoint, "served from cache");
            return Ok(Fetched::Hit(payload));
        }

        let decision = self.limiter.check_limit().await;
        if !decision.allowed {
            match options.quota {
                QuotaMode::Fail => {
                    return Err(FetchError::QuotaExceeded { retry_at: decision.reset_time });
                }
                QuotaMode::Wait(max_wait) => {
                    info!(
                        endpoint = %request.endpoint,
                        current = decision.current_count,
                        limit = decision.limit,
                        "quota exhausted; waiting for capacity"
                    );
                    if !self.limiter.wait_for_availability(max_wait, &options.cancel).await {
                        return Err(FetchError::QuotaExceeded { retry_at: decision.reset_time });
                    }
                }
            }
        }

        self.attempt_with_retries(request, &key, options).await
    }

    async fn attempt_with_retries(
        &self,
        request: &ApiRequest,
        key: &fetchguard_core::CacheKey,
        options: &FetchOptions,
    ) -> Result<Fetched, FetchError> {
        let max_attempts = self.backoff.max_attempts();
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            // The circuit may open mid-loop from this call's own failures.
            if !self.breaker.can_execute() {
                warn!(endpoint = %request.endpoint, "circuit open; refusing upstream dispatch");
                return Err(FetchError::CircuitOpen);
            }

            self.limiter.record_request().await;

            let kind = match self.transport.fetch(request).await {
                Ok(response) if response.is_success() => {
                    self.breaker.record_success();
                    match options.cache_ttl {
                        Some(ttl) => self.cache.set_with_ttl(key, &response.payload, ttl).await,
                        None => self.cache.set(key, &response.payload).await,
                    }
                    debug!(endpoint = %request.endpoint, attempt, "upstream fetch succeeded");
                    return Ok(Fetched::Fresh(response.payload));
                }
                Ok(response) => FailureKind::from_status(response.status, response.retry_after),
                Err(err) => {
                    debug!(endpoint = %request.endpoint, error = %err, "transport failure");
                    FailureKind::Network
                }
            };

            match kind {
                // A 404 is a well-formed reply about the resource, not an
                // upstream health signal. It still proves reachability, so
                // an outstanding half-open probe is resolved by it; a
                // closed circuit's failure tally is left untouched.
                FailureKind::NotFound => {
                    self.breaker.record_reachable();
                    return if options.allow_not_found {
                        debug!(endpoint = %request.endpoint, "resource absent upstream");
                        Ok(Fetched::Absent)
                    } else {
                        Err(FetchError::NotFound)
                    };
                }
                FailureKind::Client { status } => {
                    self.breaker.record_reachable();
                    return Err(FetchError::Client { status });
                }
                _ => {}
            }

            self.breaker.record_failure();
            last_status = kind.status();

            if attempt < max_attempts {
                let delay = self.backoff.delay_for(attempt, &kind);
                warn!(
                    endpoint = %request.endpoint,
                    attempt,
                    status = ?last_status,
                    delay_ms = delay.as_millis() as u64,
                    "upstream attempt failed; backing off"
                );
                tokio::select! {
                    _ = options.cancel.cancelled() => {
                        debug!(endpoint = %request.endpoint, "fetch cancelled during backoff");
                        return Err(FetchError::RetriesExhausted { attempts: attempt, last_status });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        warn!(
            endpoint = %request.endpoint,
            attempts = max_attempts,
            status = ?last_status,
            "retries exhausted"
        );
        // Deliberately not cached: the next caller should try upstream again.
        Err(FetchError::RetriesExhausted { attempts: max_attempts, last_status })
    }

    /// Dry-run quota check; does not consume capacity
    pub async fn check(&self) -> LimitDecision {
        self.limiter.check_limit().await
    }

    /// Force the quota window to restart from zero
    pub async fn reset(&self) {
        self.limiter.reset_window().await;
    }

    /// Drop a cached response so the next fetch goes upstream
    pub async fn invalidate(&self, request: &ApiRequest) {
        self.cache.delete(&request.cache_key()).await;
    }

    pub async fn usage_stats(&self) -> UsageStats {
        self.limiter.usage_stats().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// One-line human-readable summary of quota, circuit, and cache state
    pub async fn status_report(&self) -> String {
        let usage = self.limiter.usage_stats().await;
        let breaker = self.breaker.snapshot();
        let cache = self.cache.stats();

        format!(
            "quota {}/{} ({:.1}% used, ~{:.0}/h projected) | circuit {} ({} consecutive failures) | cache {} local hits, {} shared hits, {} misses ({:.1}% hit rate)",
            usage.total_requests,
            usage.limit,
            usage.utilization_percent,
            usage.projected_hourly_rate,
            breaker.state,
            breaker.consecutive_failures,
            cache.local_hits,
            cache.shared_hits,
            cache.misses,
            cache.hit_rate() * 100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use fetchguard_core::{MemoryStore, MockClock, NoJitter};
    use serde_json::json;

    use super::*;
    use crate::transport::{ApiResponse, TransportError};

    /// Transport that replays a scripted sequence of outcomes
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ApiResponse, TransportError>>) -> Self {
            Self { script: Mutex::new(script.into()), calls: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Arc<ScriptedTransport> {
        async fn fetch(&self, _request: &ApiRequest) -> Result<ApiResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Connect { message: "script exhausted".into() }))
        }
    }

    fn ok_response(payload: Value) -> Result<ApiResponse, TransportError> {
        Ok(ApiResponse { status: 200, payload, retry_after: None })
    }

    fn status_response(status: u16) -> Result<ApiResponse, TransportError> {
        Ok(ApiResponse { status, payload: Value::Null, retry_after: None })
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            backoff: BackoffConfig {
                base: Duration::from_millis(1),
                jitter_ceiling: Duration::ZERO,
                ..BackoffConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(
        transport: Arc<ScriptedTransport>,
        config: OrchestratorConfig,
        clock: MockClock,
    ) -> Orchestrator<Arc<ScriptedTransport>, MemoryStore<MockClock>, MockClock, NoJitter> {
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Orchestrator::with_parts(transport, store, config, clock, NoJitter).unwrap()
    }

    #[tokio::test]
    async fn test_fresh_fetch_then_cache_hit() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok_response(json!({"id": 7}))]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());
        let request = ApiRequest::new("/people/").param("id", "7");

        let first = orch.fetch(&request, &FetchOptions::default()).await.unwrap();
        assert_eq!(first, Fetched::Fresh(json!({"id": 7})));

        let second = orch.fetch(&request, &FetchOptions::default()).await.unwrap();
        assert_eq!(second, Fetched::Hit(json!({"id": 7})));

        // The hit never reached the transport.
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_quota_exhausted_fails_without_dispatch() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let mut config = fast_config();
        config.limiter = RateLimiterConfig::builder().hourly_limit(10).build().unwrap();
        let orch = orchestrator(Arc::clone(&transport), config, MockClock::new());

        // buffer limit is 9; fill the window
        for _ in 0..9 {
            orch.limiter.record_request().await;
        }

        let request = ApiRequest::new("/people/");
        let err = orch.fetch(&request, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::QuotaExceeded { .. }));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_dispatch() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());

        for _ in 0..3 {
            orch.breaker.record_failure();
        }
        assert_eq!(orch.breaker.state(), fetchguard_core::CircuitState::Open);

        let request = ApiRequest::new("/people/");
        let err = orch.fetch(&request, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::CircuitOpen));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_absent_resource_leaves_breaker_untouched() {
        let transport = Arc::new(ScriptedTransport::new(vec![status_response(404)]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());

        let request = ApiRequest::new("/people/").param("id", "missing");
        let options = FetchOptions::default().allow_not_found();
        let result = orch.fetch(&request, &options).await.unwrap();

        assert!(result.is_absent());
        assert_eq!(orch.breaker.consecutive_failures(), 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_absent_probe_unwedges_circuit_after_cooldown() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status_response(500),
            status_response(404),
            ok_response(json!({"back": true})),
        ]));
        let mut config = fast_config();
        config.breaker.failure_threshold = 1;
        config.backoff.max_attempts = 1;
        let clock = MockClock::new();
        let orch = orchestrator(Arc::clone(&transport), config, clock.clone());
        let options = FetchOptions::default().allow_not_found();

        // One failure opens the circuit.
        let request = ApiRequest::new("/people/").param("id", "1");
        let err = orch.fetch(&request, &options).await.unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { .. }));
        assert_eq!(orch.breaker.state(), fetchguard_core::CircuitState::Open);

        // The cooldown lapses and the recovery probe finds the resource
        // missing. The upstream answered, so the circuit must close rather
        // than wait forever for a probe verdict.
        clock.advance_secs(61);
        let probe = ApiRequest::new("/people/").param("id", "2");
        let fetched = orch.fetch(&probe, &options).await.unwrap();
        assert!(fetched.is_absent());
        assert_eq!(orch.breaker.state(), fetchguard_core::CircuitState::Closed);

        // Later traffic flows normally.
        let request = ApiRequest::new("/people/").param("id", "3");
        let fetched = orch.fetch(&request, &options).await.unwrap();
        assert_eq!(fetched, Fetched::Fresh(json!({"back": true})));
    }

    #[tokio::test]
    async fn test_not_found_without_opt_in_is_an_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![status_response(404)]));
        let orch = orchestrator(transport, fast_config(), MockClock::new());

        let request = ApiRequest::new("/people/").param("id", "missing");
        let err = orch.fetch(&request, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound));
    }

    #[tokio::test]
    async fn test_client_error_propagates_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![status_response(403)]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());

        let request = ApiRequest::new("/people/");
        let err = orch.fetch(&request, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::Client { status: 403 }));
        assert_eq!(transport.calls(), 1);
        // A rejected request is still not an upstream health failure.
        assert_eq!(orch.breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_server_errors_retry_then_exhaust() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status_response(500),
            status_response(502),
            status_response(503),
            status_response(500),
            status_response(500),
        ]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());

        let request = ApiRequest::new("/people/");
        let err = orch.fetch(&request, &FetchOptions::default()).await.unwrap_err();

        // Threshold is 3, so the circuit opens mid-loop and the remaining
        // attempts are refused without dispatch.
        assert!(matches!(err, FetchError::CircuitOpen));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_last_status() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status_response(500),
            status_response(502),
        ]));
        let mut config = fast_config();
        config.backoff.max_attempts = 2;
        config.breaker.failure_threshold = 10;
        let orch = orchestrator(Arc::clone(&transport), config, MockClock::new());

        let request = ApiRequest::new("/people/");
        let err = orch.fetch(&request, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::RetriesExhausted { attempts: 2, last_status: Some(502) }
        ));
    }

    #[tokio::test]
    async fn test_failure_then_success_recovers() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status_response(500),
            ok_response(json!({"ok": true})),
        ]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());

        let request = ApiRequest::new("/people/");
        let result = orch.fetch(&request, &FetchOptions::default()).await.unwrap();

        assert_eq!(result, Fetched::Fresh(json!({"ok": true})));
        assert_eq!(orch.breaker.consecutive_failures(), 0);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_every_dispatched_attempt_consumes_quota() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status_response(500),
            ok_response(json!({})),
        ]));
        let orch = orchestrator(transport, fast_config(), MockClock::new());

        let request = ApiRequest::new("/people/");
        orch.fetch(&request, &FetchOptions::default()).await.unwrap();

        let usage = orch.usage_stats().await;
        assert_eq!(usage.total_requests, 2);
    }

    #[tokio::test]
    async fn test_cancelled_backoff_stops_retrying() {
        let transport = Arc::new(ScriptedTransport::new(vec![status_response(500)]));
        let mut config = fast_config();
        // Long enough that the sleep only ends via cancellation.
        config.backoff.base = Duration::from_secs(600);
        let orch = orchestrator(Arc::clone(&transport), config, MockClock::new());

        let token = CancellationToken::new();
        token.cancel();
        let options = FetchOptions::default().cancel_token(token);

        let request = ApiRequest::new("/people/");
        let err = orch.fetch(&request, &options).await.unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_status_report_mentions_all_sections() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let orch = orchestrator(transport, fast_config(), MockClock::new());

        let report = orch.status_report().await;
        assert!(report.contains("quota"));
        assert!(report.contains("circuit CLOSED"));
        assert!(report.contains("cache"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok_response(json!(1)),
            ok_response(json!(2)),
        ]));
        let orch = orchestrator(Arc::clone(&transport), fast_config(), MockClock::new());
        let request = ApiRequest::new("/people/").param("id", "1");

        orch.fetch(&request, &FetchOptions::default()).await.unwrap();
        orch.invalidate(&request).await;
        let refetched = orch.fetch(&request, &FetchOptions::default()).await.unwrap();

        assert_eq!(refetched, Fetched::Fresh(json!(2)));
        assert_eq!(transport.calls(), 2);
    }
}
