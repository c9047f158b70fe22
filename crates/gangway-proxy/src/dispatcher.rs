//! The request dispatcher.
//!
//! Composes the whole pipeline for one inbound request: tracing span,
//! rate-limit admission, route matching, service resolution, endpoint
//! selection, the upstream call, outcome classification with breaker
//! feedback, and telemetry. Every request produces exactly one
//! `requests_total` increment, one latency observation and one
//! `http_request` log line, whatever the outcome.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use gangway_common::rate_limit::RateLimiter;
use gangway_common::registry::AddressResolver;
use gangway_metrics::ProxyMetrics;
use tracing::Instrument;
use uuid::Uuid;

use crate::balancer::Balancer;
use crate::routing::RouteTable;
use crate::transport::UpstreamClient;

/// Upstream label used before an endpoint has been chosen.
const UNKNOWN_UPSTREAM: &str = "unknown";

/// Hop-by-hop headers that must not be forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything the dispatcher needs, built once at startup and shared by
/// every request handler.
pub struct ProxyContext {
    pub routes: RouteTable,
    pub limiter: Option<RateLimiter>,
    pub resolver: Arc<dyn AddressResolver>,
    pub balancer: Arc<Balancer>,
    pub client: UpstreamClient,
    pub metrics: Arc<ProxyMetrics>,
    /// Use https for upstream connections.
    pub upstream_tls: bool,
    /// Static fallback authority when no route or default service matches.
    pub static_target: Option<String>,
}

struct Outcome {
    response: Response,
    upstream: String,
    body_size: u64,
}

/// Axum handler for every proxied request.
pub async fn dispatch(State(ctx): State<Arc<ProxyContext>>, req: Request) -> Response {
    let started = Instant::now();
    let trace_id = Uuid::new_v4().simple().to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        http.method = %method,
        http.url = %req.uri(),
        http.user_agent = %user_agent,
        trace_id = %trace_id,
        otel.status_code = tracing::field::Empty,
    );

    let outcome = forward(&ctx, req, &trace_id).instrument(span.clone()).await;

    let latency = started.elapsed();
    let status = outcome.response.status();
    span.record(
        "otel.status_code",
        if status.as_u16() >= 400 { "ERROR" } else { "OK" },
    );

    ctx.metrics
        .requests_total
        .with_label_values(&[method.as_str(), status.as_str(), &outcome.upstream])
        .inc();
    ctx.metrics
        .request_latency_seconds
        .with_label_values(&[method.as_str(), &outcome.upstream])
        .observe(latency.as_secs_f64());

    tracing::info!(
        parent: &span,
        method = %method,
        path = %path,
        upstream = %outcome.upstream,
        status = status.as_u16(),
        latency_ms = latency.as_millis() as u64,
        size_bytes = outcome.body_size,
        trace_id = %trace_id,
        "http_request"
    );

    outcome.response
}

async fn forward(ctx: &ProxyContext, req: Request, trace_id: &str) -> Outcome {
    let path = req.uri().path().to_string();

    // Admission.
    if let Some(limiter) = &ctx.limiter {
        if !limiter.allow(&path) {
            ctx.metrics
                .rate_limited_total
                .with_label_values(&[path.as_str()])
                .inc();
            tracing::warn!(route = %path, trace_id = %trace_id, "rate_limited");
            return text_outcome(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
                UNKNOWN_UPSTREAM,
            );
        }
    }

    // Resolution: route → service → endpoints → endpoint.
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let upstream = match ctx.routes.service_for(host, &path) {
        Some(service) => {
            let service = service.to_string();
            let addrs = match ctx.resolver.resolve(&service) {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::error!(service = %service, error = %e, trace_id = %trace_id, "resolve_failed");
                    return text_outcome(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service Unavailable",
                        UNKNOWN_UPSTREAM,
                    );
                }
            };
            // Register the bindings so the health monitor probes them.
            ctx.balancer.sync_service(&service, &addrs);
            match ctx.balancer.select(&service, &addrs) {
                Some(endpoint) => endpoint,
                None => {
                    tracing::warn!(service = %service, trace_id = %trace_id, "no_admissible_upstream");
                    return text_outcome(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service Unavailable",
                        UNKNOWN_UPSTREAM,
                    );
                }
            }
        }
        None => match &ctx.static_target {
            Some(target) => target.clone(),
            None => {
                tracing::warn!(host = %host, path = %path, trace_id = %trace_id, "no_route");
                return text_outcome(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service Unavailable",
                    UNKNOWN_UPSTREAM,
                );
            }
        },
    };

    // Invocation: rewrite the authority, preserve path and query. The
    // deadline bounds every attempt and backoff sleep in the transport.
    let deadline = ctx.client.request_deadline(Instant::now());
    let scheme = if ctx.upstream_tls { "https" } else { "http" };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or(path);
    let url = format!("{}://{}{}", scheme, upstream, path_and_query);
    let method = req.method().clone();
    let outbound_headers = filter_headers(req.headers(), true);

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, trace_id = %trace_id, "client_body_error");
            return text_outcome(StatusCode::BAD_REQUEST, "Bad Request", &upstream);
        }
    };

    match ctx
        .client
        .execute(method, &url, outbound_headers, body, Some(deadline))
        .await
    {
        Ok(upstream_response) => {
            // Feedback: a 5xx counts against the breaker, except 502 —
            // the transport-error arm below is the sole source of
            // proxy-generated 502s and already reports the failure, so
            // counting it here again would double-book.
            let code = upstream_response.status.as_u16();
            if code >= 500 && upstream_response.status != StatusCode::BAD_GATEWAY {
                ctx.balancer.record_failure(&upstream);
            } else if code < 500 {
                ctx.balancer.record_success(&upstream);
            }

            let size = upstream_response.body.len() as u64;
            let mut builder = Response::builder().status(upstream_response.status);
            if let Some(headers) = builder.headers_mut() {
                *headers = filter_headers(&upstream_response.headers, false);
            }
            let response = builder.body(Body::from(upstream_response.body)).unwrap();
            Outcome {
                response,
                upstream,
                body_size: size,
            }
        }
        Err(e) => {
            tracing::error!(upstream = %upstream, error = %e, trace_id = %trace_id, "upstream_error");
            ctx.balancer.record_failure(&upstream);
            text_outcome(StatusCode::BAD_GATEWAY, "Bad Gateway", &upstream)
        }
    }
}

/// Copies headers, dropping hop-by-hop headers plus the fields the proxy
/// or its HTTP stack owns (Host and Content-Length are recomputed).
fn filter_headers(headers: &HeaderMap, outbound: bool) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lowered = name.as_str();
        if HOP_BY_HOP.contains(&lowered) {
            continue;
        }
        if lowered == "content-length" {
            continue;
        }
        if outbound && lowered == "host" {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn text_outcome(status: StatusCode, message: &'static str, upstream: &str) -> Outcome {
    let response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message))
        .unwrap();
    Outcome {
        response,
        upstream: upstream.to_string(),
        body_size: message.len() as u64,
    }
}
