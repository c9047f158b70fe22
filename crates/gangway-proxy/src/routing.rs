//! Host/path routing.
//!
//! Rules are evaluated in declaration order and the first match wins. An
//! empty host or path prefix acts as a wildcard. When nothing matches,
//! the configured default service (if any) is used.

use gangway_common::config::RouteRule;

pub struct RouteTable {
    rules: Vec<RouteRule>,
    default_service: Option<String>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>, default_service: Option<String>) -> Self {
        let default_service = default_service.filter(|s| !s.is_empty());
        Self {
            rules,
            default_service,
        }
    }

    /// Maps a request host and path to a service name.
    ///
    /// The host is compared case-insensitively with any port stripped.
    pub fn service_for(&self, host: &str, path: &str) -> Option<&str> {
        let host = host.split(':').next().unwrap_or("");
        for rule in &self.rules {
            if !rule.host.is_empty() && !rule.host.eq_ignore_ascii_case(host) {
                continue;
            }
            if !rule.path_prefix.is_empty() && !path.starts_with(rule.path_prefix.as_str()) {
                continue;
            }
            return Some(&rule.service);
        }
        self.default_service.as_deref()
    }
}
