//! Upstream transport abstraction and the reqwest-backed implementation
//!
//! The orchestrator only ever sees [`Transport`]; tests substitute scripted
//! implementations, production wires in [`HttpTransport`].

use std::time::Duration;

use async_trait::async_trait;
use fetchguard_core::{derive_key, CacheKey};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = concat!("fetchguard/", env!("CARGO_PKG_VERSION"));

/// A single logical request against the upstream API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Endpoint path, e.g. `/people/`
    pub endpoint: String,
    /// Query parameters; ordering is irrelevant for caching
    pub params: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), params: Vec::new() }
    }

    /// Append a query parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// The cache key identifying this request's response
    pub fn cache_key(&self) -> CacheKey {
        derive_key(&self.endpoint, self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Raw upstream reply, before any resilience policy is applied
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub payload: Value,
    /// Parsed `Retry-After` header, when the upstream sent one
    pub retry_after: Option<Duration>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failures; every variant is treated as retryable
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {message}")]
    Connect { message: String },
    #[error("http error: {message}")]
    Http { message: String },
}

/// Asynchronous upstream transport
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Perform one network attempt for the given request
    ///
    /// A reply with a non-success status is `Ok` — classification is the
    /// caller's job. `Err` means no well-formed reply was obtained.
    async fn fetch(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Builder for [`HttpTransport`]
pub struct HttpTransportBuilder {
    base_url: String,
    timeout: Duration,
    user_agent: String,
    auth_token: Option<String>,
}

impl HttpTransportBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            auth_token: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Token sent as `Authorization: Token <value>` on every request
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let mut headers = HeaderMap::new();
        let ua = HeaderValue::from_str(&self.user_agent)
            .map_err(|e| TransportError::Http { message: format!("invalid user agent: {e}") })?;
        headers.insert(USER_AGENT, ua);

        if let Some(token) = &self.auth_token {
            let mut value = HeaderValue::from_str(&format!("Token {token}"))
                .map_err(|e| TransportError::Http { message: format!("invalid auth token: {e}") })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Http { message: e.to_string() })?;

        Ok(HttpTransport { client, base_url: self.base_url.trim_end_matches('/').to_string() })
    }
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn builder(base_url: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder::new(base_url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        debug!(%url, params = request.params.len(), "dispatching upstream request");

        let response = self
            .client
            .get(&url)
            .query(&request.params)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        // Error replies are often not JSON; a well-formed status line is
        // still a valid reply, so fall back to a null payload.
        let payload = response.json::<Value>().await.unwrap_or(Value::Null);

        Ok(ApiResponse { status, payload, retry_after })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect { message: err.to_string() }
    } else {
        TransportError::Http { message: err.to_string() }
    }
}
