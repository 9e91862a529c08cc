//! HTTP client for synchronous upstream calls made from handlers.
//!
//! Handlers that consult an upstream service (the decision agent, a
//! notification gateway) do so through this client: one connection pool,
//! a per-call deadline, and errors left as `reqwest::Error` so the error
//! classifier sees timeouts, connection failures, and status classes
//! directly. Pair it with a [`crate::circuit::CircuitBreaker`] per
//! endpoint.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Upstream client configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the upstream service.
    pub base_url: String,

    /// Per-call deadline.
    pub timeout: Duration,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl UpstreamConfig {
    /// Configuration with the platform's standard 5 s agent deadline.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            user_agent: "stafette/1.0".to_string(),
        }
    }

    /// Overrides the per-call deadline (e.g. 30 s for slow planning
    /// upstreams).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// JSON-over-HTTP client with a per-call deadline.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    /// Builds the client and its connection pool.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the HTTP client cannot be
    /// constructed.
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client, config })
    }

    /// POSTs a JSON body and decodes the JSON response.
    ///
    /// Non-2xx responses surface as status errors so the classifier can
    /// split 4xx (terminal) from 5xx (retryable).
    ///
    /// # Errors
    ///
    /// Returns `reqwest::Error` for connection failures, deadline
    /// overruns, error statuses, and undecodable response bodies.
    pub async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, reqwest::Error>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));

        debug!(url = %url, "calling upstream");

        let response = self.client.post(&url).json(body).send().await?.error_for_status()?;

        response.json().await
    }

    /// The configured per-call deadline.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}
