//! Token-bucket rate limiting.
//!
//! One bucket per route key (the request path). Buckets refill
//! continuously at the configured rate and are created lazily the first
//! time a route is seen. When the configured rate is zero the limiter is
//! simply not constructed by the caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Token bucket state for a single route.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Last time this bucket was refilled.
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a new bucket, starting full.
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Attempts to consume one token, refilling for the time elapsed
    /// since the last call. Tokens never exceed `capacity`.
    fn try_consume(&mut self, capacity: u32, refill_rate: u32, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate as f64).min(capacity as f64);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-route rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    capacity: u32,
    refill_rate: u32,
    /// Path prefixes the limiter applies to. Empty means every route.
    scoped_routes: Vec<String>,
}

impl RateLimiter {
    pub fn new(refill_rate: u32, capacity: u32, scoped_routes: Vec<String>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_rate,
            scoped_routes,
        }
    }

    /// Checks whether a request for the given route is admitted.
    ///
    /// Routes outside the configured scope are always admitted.
    pub fn allow(&self, route: &str) -> bool {
        if !self.scoped_routes.is_empty()
            && !self.scoped_routes.iter().any(|p| route.starts_with(p.as_str()))
        {
            return true;
        }
        self.allow_at(route, Instant::now())
    }

    fn allow_at(&self, route: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(route.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.capacity, self.refill_rate, now)
    }
}
