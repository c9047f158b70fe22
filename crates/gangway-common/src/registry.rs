//! Service registry resolution.
//!
//! The registry is a YAML file mapping service names to upstream
//! addresses:
//!
//! ```yaml
//! services:
//!   billing: "127.0.0.1:9091"
//!   search:
//!     - "127.0.0.1:9092"
//!     - "127.0.0.1:9093"
//! ```
//!
//! A plain string counts as a singleton list. The file is parsed lazily
//! and cached by modification time, so an edited registry takes effect on
//! the next request without a restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("service {0:?} not found in registry")]
    ServiceNotFound(String),

    #[error("registry source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Resolves a service name to its current list of `host:port` endpoints.
///
/// Implementations must return a non-empty list on success. Callers must
/// not assume the list is stable across calls.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, service: &str) -> Result<Vec<String>, ResolveError>;
}

struct CachedRegistry {
    modified: SystemTime,
    services: HashMap<String, Vec<String>>,
}

/// File-backed resolver with mtime-keyed caching.
pub struct FileResolver {
    path: PathBuf,
    cache: Mutex<Option<CachedRegistry>>,
}

impl FileResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    fn refresh_and_lookup(&self, service: &str) -> Result<Vec<String>, ResolveError> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| ResolveError::SourceUnavailable(format!("{}: {}", self.path.display(), e)))?;

        let mut cache = self.cache.lock().unwrap();
        let stale = match cache.as_ref() {
            Some(c) => c.modified != modified,
            None => true,
        };
        if stale {
            let text = std::fs::read_to_string(&self.path).map_err(|e| {
                ResolveError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
            })?;
            let services = parse_registry(&text)?;
            *cache = Some(CachedRegistry { modified, services });
        }

        let services = &cache.as_ref().unwrap().services;
        match services.get(service) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(ResolveError::ServiceNotFound(service.to_string())),
        }
    }
}

impl AddressResolver for FileResolver {
    fn resolve(&self, service: &str) -> Result<Vec<String>, ResolveError> {
        self.refresh_and_lookup(service)
    }
}

/// Parses the `services:` mapping, accepting both string and list values.
/// Blank entries and non-string list items are dropped.
fn parse_registry(text: &str) -> Result<HashMap<String, Vec<String>>, ResolveError> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| ResolveError::SourceUnavailable(format!("parse registry: {}", e)))?;

    let mut out = HashMap::new();
    let Some(services) = doc.get("services").and_then(|v| v.as_mapping()) else {
        return Ok(out);
    };

    for (key, value) in services {
        let Some(name) = key.as_str() else { continue };
        let addrs: Vec<String> = match value {
            serde_yaml::Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if !addrs.is_empty() {
            out.insert(name.to_string(), addrs);
        }
    }
    Ok(out)
}
