//! Proxy configuration.
//!
//! Loaded once at startup from a YAML file. Every section has serde
//! defaults so a minimal config only needs `listen_port` and either a
//! default service or routing rules.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{GangwayError, Result};

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Port the proxy listens on (e.g. "8080").
    pub listen_port: String,
    /// Default service name used when no routing rule matches.
    pub target_service_name: String,
    /// Path to the YAML service registry file.
    pub registry_file: String,
    /// Static fallback address when service-based routing is not in use.
    pub target_service_addr: String,
    /// Routing rules, evaluated in declaration order. First match wins.
    pub routes: Vec<RouteRule>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub tracing: TracingConfig,
    pub tls: TlsConfig,
}

/// A host/path routing rule mapping a request to a service name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouteRule {
    /// Exact host match, without port. Empty matches any host.
    pub host: String,
    /// Path prefix match. Empty matches any path.
    pub path_prefix: String,
    /// Target service name in the registry.
    pub service: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker. 0 means the default (3).
    pub failure_threshold: u32,
    /// How long the breaker stays open, as a duration string ("20s", "500ms").
    pub open_duration: String,
}

impl CircuitBreakerConfig {
    pub fn threshold(&self) -> u32 {
        if self.failure_threshold > 0 {
            self.failure_threshold
        } else {
            3
        }
    }

    /// Parsed open duration, defaulting to 20s when absent or malformed.
    pub fn duration(&self) -> Duration {
        parse_duration(&self.open_duration).unwrap_or(Duration::from_secs(20))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained requests per second per route. 0 disables rate limiting.
    pub requests_per_second: u32,
    /// Bucket capacity (maximum burst).
    pub burst_size: u32,
    /// Path prefixes the limiter applies to. Empty means all routes.
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// debug, info, warn or error. Anything else falls back to info.
    pub level: String,
    /// "json" or "console".
    pub format: String,
    /// "production" or "development".
    pub environment: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub service_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_dir: String,
    /// Listen port when TLS is enabled, if different from `listen_port`.
    pub server_port: String,
    /// Use HTTPS for upstream connections.
    pub upstream_tls: bool,
}

impl ProxyConfig {
    /// Reads and parses the configuration file.
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GangwayError::Config(format!("read {}: {}", path, e)))?;
        let config: ProxyConfig = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    /// The socket address the proxy should bind, honoring the TLS port
    /// override when TLS is enabled.
    pub fn listen_addr(&self) -> String {
        let port = if self.tls.enabled && !self.tls.server_port.is_empty() {
            &self.tls.server_port
        } else {
            &self.listen_port
        };
        format!("0.0.0.0:{}", port)
    }
}

/// Parses duration strings of the form "300ms", "20s" or "5m".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}
