//! Retrying upstream transport.
//!
//! Executes an HTTP request against a concrete endpoint URL through a
//! pooled client. Transport-level failures (connect, TLS, timeout before
//! response headers) are retried with exponential backoff, subject to the
//! retry budget and idempotency gating. An HTTP response of any status is
//! returned as-is and never retried here; the dispatcher classifies it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use gangway_metrics::ProxyMetrics;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("timed out waiting for response headers")]
    HeaderTimeout,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Retry only idempotent methods (GET/HEAD/PUT/DELETE).
    pub idempotent_only: bool,
    /// Backoff base; attempt `i` sleeps `base * 2^i`.
    pub backoff_base: Duration,
    /// Total time budget for a request across all attempts and backoff
    /// sleeps. The dispatcher derives the per-request deadline from this.
    pub total_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            idempotent_only: true,
            backoff_base: Duration::from_millis(150),
            total_timeout: Duration::from_secs(30),
        }
    }
}

/// A fully buffered upstream response.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamClient {
    client: reqwest::Client,
    policy: RetryPolicy,
    /// Per-attempt bound on time to response headers.
    header_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl UpstreamClient {
    pub fn new(policy: RetryPolicy, metrics: Arc<ProxyMetrics>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            policy,
            header_timeout: Duration::from_secs(10),
            metrics,
        })
    }

    /// The deadline for a request that started at `start`, per the
    /// policy's total time budget.
    pub fn request_deadline(&self, start: Instant) -> Instant {
        start + self.policy.total_timeout
    }

    /// Executes the request, retrying transport errors within the policy
    /// and the optional deadline. Each attempt's wait for response
    /// headers is capped by the time remaining until the deadline, and
    /// backoff sleeps never run past it. The response body is buffered; a
    /// body read failure after headers is a transport error and is not
    /// retried.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
        deadline: Option<Instant>,
    ) -> Result<UpstreamResponse, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            let send = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone())
                .body(body.clone())
                .send();

            let attempt_timeout = match deadline {
                Some(deadline) => self
                    .header_timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.header_timeout,
            };
            let error = match tokio::time::timeout(attempt_timeout, send).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let body = response.bytes().await?;
                    return Ok(UpstreamResponse {
                        status,
                        headers,
                        body,
                    });
                }
                Ok(Err(e)) => TransportError::Request(e),
                Err(_) => TransportError::HeaderTimeout,
            };

            if attempt >= self.policy.max_retries || !self.method_retryable(&method) {
                return Err(error);
            }
            let backoff = self.policy.backoff_base * 2u32.pow(attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + backoff >= deadline {
                    return Err(error);
                }
            }

            self.metrics
                .retries_total
                .with_label_values(&[method.as_str()])
                .inc();
            tracing::warn!(
                url = %url,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "upstream_retry"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    fn method_retryable(&self, method: &Method) -> bool {
        if !self.policy.idempotent_only {
            return true;
        }
        matches!(
            *method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE
        )
    }
}
