//! # Gangway entry point
//!
//! Sidecar reverse proxy: forwards HTTP traffic to dynamically discovered
//! upstreams while enforcing health checks, circuit breaking, retries and
//! rate limits.
//!
//! ```bash
//! gangway -c config.yaml
//! ```
//!
//! Exits 0 on SIGINT/SIGTERM; non-zero when the configuration cannot be
//! loaded or the listener cannot bind.

use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;
use gangway_common::config::{LoggingConfig, ProxyConfig};
use gangway_common::rate_limit::RateLimiter;
use gangway_common::registry::FileResolver;
use gangway_metrics::ProxyMetrics;
use gangway_proxy::balancer::{Balancer, BalancerConfig};
use gangway_proxy::breaker::BreakerConfig;
use gangway_proxy::dispatcher::ProxyContext;
use gangway_proxy::health::{HealthConfig, HealthMonitor};
use gangway_proxy::routing::RouteTable;
use gangway_proxy::server::ProxyServer;
use gangway_proxy::transport::{RetryPolicy, UpstreamClient};

#[derive(FromArgs)]
/// Gangway - sidecar reverse proxy
struct Args {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "\"config.yaml\".into()")]
    config: String,
}

fn init_logging(config: &LoggingConfig) {
    let default_level = match config.level.as_str() {
        "debug" | "info" | "warn" | "error" => config.level.as_str(),
        _ => "info",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if config.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Accepts both "host:port" and full "http(s)://host:port" forms for the
/// static fallback target.
fn strip_scheme(addr: &str) -> String {
    addr.trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let config = ProxyConfig::load(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;

    init_logging(&config.logging);

    if config.tracing.enabled {
        tracing::info!(
            service = %config.tracing.service_name,
            endpoint = %config.tracing.endpoint,
            "tracing enabled"
        );
    }

    let metrics = Arc::new(ProxyMetrics::new());

    let balancer_config = BalancerConfig {
        breaker: BreakerConfig {
            failure_threshold: config.circuit_breaker.threshold(),
            open_duration: config.circuit_breaker.duration(),
        },
        ..BalancerConfig::default()
    };
    let balancer = Arc::new(Balancer::new(balancer_config, metrics.clone()));

    let limiter = (config.rate_limit.requests_per_second > 0).then(|| {
        tracing::info!(
            rps = config.rate_limit.requests_per_second,
            burst = config.rate_limit.burst_size,
            routes = config.rate_limit.routes.len(),
            "rate limiting initialized"
        );
        RateLimiter::new(
            config.rate_limit.requests_per_second,
            config.rate_limit.burst_size,
            config.rate_limit.routes.clone(),
        )
    });

    let default_service = (!config.target_service_name.is_empty())
        .then(|| config.target_service_name.clone());
    let routes = RouteTable::new(config.routes.clone(), default_service);

    let resolver = Arc::new(FileResolver::new(config.registry_file.clone()));

    let client = UpstreamClient::new(RetryPolicy::default(), metrics.clone())
        .map_err(|e| anyhow::anyhow!("failed to build upstream client: {}", e))?;

    let static_target = (!config.target_service_addr.is_empty())
        .then(|| strip_scheme(&config.target_service_addr));

    let context = Arc::new(ProxyContext {
        routes,
        limiter,
        resolver,
        balancer: balancer.clone(),
        client,
        metrics: metrics.clone(),
        upstream_tls: config.tls.upstream_tls,
        static_target,
    });

    let _monitor_handle =
        HealthMonitor::new(balancer, metrics, HealthConfig::default()).spawn();

    tracing::info!(
        listen_port = %config.listen_port,
        target_service = %config.target_service_name,
        "gangway_proxy_started"
    );

    ProxyServer::new(context)
        .run(&config.listen_addr(), shutdown_signal())
        .await?;

    tracing::info!("shutting_down");
    Ok(())
}
