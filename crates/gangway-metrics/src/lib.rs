//! Prometheus metrics for the gangway proxy.
//!
//! All metrics live in one owned registry constructed at startup and
//! shared by reference; nothing here is a global. The proxy serves the
//! text exposition from `render()` on `GET /metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// The metrics the proxy emits.
pub struct ProxyMetrics {
    registry: Registry,

    /// Requests handled, by method, response status and chosen upstream.
    pub requests_total: IntCounterVec,
    /// End-to-end request latency, by method and upstream.
    pub request_latency_seconds: HistogramVec,
    /// Upstream retries performed, by method.
    pub retries_total: IntCounterVec,
    /// Requests rejected by the rate limiter, by route.
    pub rate_limited_total: IntCounterVec,
    /// Active health state per upstream: 1 up, 0 down.
    pub upstream_health: IntGaugeVec,
    /// Circuit breaker transitions, by upstream and target state.
    pub circuit_breaker_transitions_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Total number of HTTP requests handled"),
            &["method", "status", "upstream"],
        )
        .expect("requests_total");
        registry.register(Box::new(requests_total.clone())).expect("register requests_total");

        let request_latency_seconds = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "Latency of handled HTTP requests"),
            &["method", "upstream"],
        )
        .expect("request_latency_seconds");
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .expect("register request_latency_seconds");

        let retries_total = IntCounterVec::new(
            Opts::new("retries_total", "Total number of upstream retries performed"),
            &["method"],
        )
        .expect("retries_total");
        registry.register(Box::new(retries_total.clone())).expect("register retries_total");

        let rate_limited_total = IntCounterVec::new(
            Opts::new("rate_limited_total", "Total number of rate limited requests"),
            &["route"],
        )
        .expect("rate_limited_total");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register rate_limited_total");

        let upstream_health = IntGaugeVec::new(
            Opts::new("upstream_health", "Upstream health status (1 up, 0 down)"),
            &["service", "upstream"],
        )
        .expect("upstream_health");
        registry.register(Box::new(upstream_health.clone())).expect("register upstream_health");

        let circuit_breaker_transitions_total = IntCounterVec::new(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["upstream", "to_state"],
        )
        .expect("circuit_breaker_transitions_total");
        registry
            .register(Box::new(circuit_breaker_transitions_total.clone()))
            .expect("register circuit_breaker_transitions_total");

        Self {
            registry,
            requests_total,
            request_latency_seconds,
            retries_total,
            rate_limited_total,
            upstream_health,
            circuit_breaker_transitions_total,
        }
    }

    /// Renders the text exposition format for scraping.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}
