//! Round-robin load balancing with passive health and circuit breaking.
//!
//! One registry holds everything selection needs: the service → endpoint
//! bindings, per-service round-robin cursors, per-endpoint cooldowns,
//! the health table written by the monitor, and the breaker table. All
//! of it sits behind a single lock so the cursor advance, the breaker
//! consultation and the half-open trial consumption happen in one
//! critical section. The lock is never held across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gangway_metrics::ProxyMetrics;

use crate::breaker::{BreakerConfig, BreakerState, BreakerStatus, Transition};

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Passive cooldown applied to an endpoint after an observed failure.
    pub cooldown: Duration,
    pub breaker: BreakerConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Last seen endpoint list per service.
    services: HashMap<String, Vec<String>>,
    /// Per-service round-robin cursor, interpreted modulo the current
    /// endpoint list length at selection time.
    cursors: HashMap<String, usize>,
    /// Passive cooldown expiry per endpoint.
    cooldown_until: HashMap<String, Instant>,
    /// Active health per endpoint; absent means unknown.
    health: HashMap<String, bool>,
    breakers: HashMap<String, BreakerState>,
}

impl Registry {
    fn in_cooldown(&self, addr: &str, now: Instant) -> bool {
        self.cooldown_until.get(addr).is_some_and(|&until| now < until)
    }
}

pub struct Balancer {
    registry: Mutex<Registry>,
    config: BalancerConfig,
    metrics: Arc<ProxyMetrics>,
}

impl Balancer {
    pub fn new(config: BalancerConfig, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            config,
            metrics,
        }
    }

    /// Replaces the endpoint list for a service. Called on every dispatch
    /// so the health monitor always probes the current bindings.
    pub fn sync_service(&self, service: &str, addrs: &[String]) {
        let mut reg = self.registry.lock().unwrap();
        reg.services.insert(service.to_string(), addrs.to_vec());
    }

    /// Snapshot of service → endpoint bindings for the health monitor.
    pub fn snapshot_services(&self) -> Vec<(String, Vec<String>)> {
        let reg = self.registry.lock().unwrap();
        reg.services
            .iter()
            .map(|(svc, addrs)| (svc.clone(), addrs.clone()))
            .collect()
    }

    /// Selects the next endpoint for a service, or `None` when no
    /// endpoint is admissible.
    pub fn select(&self, service: &str, addrs: &[String]) -> Option<String> {
        self.select_at(service, addrs, Instant::now())
    }

    fn select_at(&self, service: &str, addrs: &[String], now: Instant) -> Option<String> {
        let n = addrs.len();
        if n == 0 {
            return None;
        }

        let mut reg = self.registry.lock().unwrap();
        let start = reg.cursors.get(service).copied().unwrap_or(0);

        // Preferred pass: no cooldown, breaker admits, not known down.
        for i in 0..n {
            let idx = (start + i) % n;
            let addr = &addrs[idx];
            if reg.in_cooldown(addr, now) {
                continue;
            }
            if !self.breaker_admits(&mut reg, addr, now) {
                continue;
            }
            if reg.health.get(addr.as_str()) == Some(&false) {
                continue;
            }
            return Some(Self::choose(&mut reg, service, addrs, idx));
        }

        // Relaxed pass: health no longer consulted; cooldown and breaker
        // still exclude.
        for i in 0..n {
            let idx = (start + i) % n;
            let addr = &addrs[idx];
            if reg.in_cooldown(addr, now) {
                continue;
            }
            if !self.breaker_admits(&mut reg, addr, now) {
                continue;
            }
            return Some(Self::choose(&mut reg, service, addrs, idx));
        }

        // Last resort: everything is cooling down. Hand one out anyway —
        // the breaker alone still gates, so a tripped endpoint is never
        // returned.
        for i in 0..n {
            let idx = (start + i) % n;
            let addr = &addrs[idx];
            if !self.breaker_admits(&mut reg, addr, now) {
                continue;
            }
            return Some(Self::choose(&mut reg, service, addrs, idx));
        }

        None
    }

    /// Records a failed upstream interaction: starts the passive cooldown
    /// and feeds the breaker.
    pub fn record_failure(&self, addr: &str) {
        self.record_failure_at(addr, Instant::now());
    }

    fn record_failure_at(&self, addr: &str, now: Instant) {
        let mut reg = self.registry.lock().unwrap();
        reg.cooldown_until.insert(addr.to_string(), now + self.config.cooldown);
        tracing::info!(
            upstream = %addr,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "health_passive_down"
        );

        let state = reg.breakers.entry(addr.to_string()).or_default();
        let was_half_open = state.status == BreakerStatus::HalfOpen;
        let transition = state.on_failure(now, &self.config.breaker);
        if let Some(t) = transition {
            let reason = if was_half_open {
                "half-open trial failed"
            } else {
                "failure threshold reached"
            };
            self.emit_transition(addr, t, reason);
        }
    }

    /// Records a successful upstream interaction.
    pub fn record_success(&self, addr: &str) {
        let mut reg = self.registry.lock().unwrap();
        if let Some(state) = reg.breakers.get_mut(addr) {
            let transition = state.on_success();
            if let Some(t) = transition {
                self.emit_transition(addr, t, "half-open trial succeeded");
            }
        }
    }

    /// Records an active probe result. Returns true when the health state
    /// flipped (or was observed for the first time). A recovered endpoint
    /// has its passive cooldown cleared.
    pub fn record_probe(&self, addr: &str, up: bool) -> bool {
        let mut reg = self.registry.lock().unwrap();
        let previous = reg.health.insert(addr.to_string(), up);
        if up {
            reg.cooldown_until.remove(addr);
        }
        previous != Some(up)
    }

    fn breaker_admits(&self, reg: &mut Registry, addr: &str, now: Instant) -> bool {
        let Some(state) = reg.breakers.get_mut(addr) else {
            return true;
        };
        let (allowed, transition) = state.check_admission(now);
        if let Some(t) = transition {
            self.emit_transition(addr, t, "open window elapsed");
        }
        allowed
    }

    fn choose(reg: &mut Registry, service: &str, addrs: &[String], idx: usize) -> String {
        let addr = addrs[idx].clone();
        reg.cursors.insert(service.to_string(), (idx + 1) % addrs.len());
        if let Some(state) = reg.breakers.get_mut(&addr) {
            state.consume_trial();
        }
        addr
    }

    fn emit_transition(&self, addr: &str, transition: Transition, reason: &str) {
        self.metrics
            .circuit_breaker_transitions_total
            .with_label_values(&[addr, transition.as_label()])
            .inc();
        tracing::info!(
            upstream = %addr,
            state = transition.as_label(),
            reason = reason,
            "circuit_breaker"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer() -> (Balancer, Arc<ProxyMetrics>) {
        let metrics = Arc::new(ProxyMetrics::new());
        let config = BalancerConfig {
            cooldown: Duration::from_secs(30),
            breaker: BreakerConfig {
                failure_threshold: 3,
                open_duration: Duration::from_secs(20),
            },
        };
        (Balancer::new(config, metrics.clone()), metrics)
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_list_returns_none() {
        let (bal, _) = balancer();
        assert_eq!(bal.select("svc", &[]), None);
    }

    #[test]
    fn test_round_robin_rotation() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2", "c:3"]);
        assert_eq!(bal.select("svc", &endpoints), Some("a:1".to_string()));
        assert_eq!(bal.select("svc", &endpoints), Some("b:2".to_string()));
        assert_eq!(bal.select("svc", &endpoints), Some("c:3".to_string()));
        assert_eq!(bal.select("svc", &endpoints), Some("a:1".to_string()));
    }

    #[test]
    fn test_round_robin_fairness() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2", "c:3"]);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..30 {
            let chosen = bal.select("svc", &endpoints).unwrap();
            *counts.entry(chosen).or_insert(0) += 1;
        }
        assert_eq!(counts["a:1"], 10);
        assert_eq!(counts["b:2"], 10);
        assert_eq!(counts["c:3"], 10);
    }

    #[test]
    fn test_cursors_are_per_service() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        assert_eq!(bal.select("one", &endpoints), Some("a:1".to_string()));
        assert_eq!(bal.select("two", &endpoints), Some("a:1".to_string()));
        assert_eq!(bal.select("one", &endpoints), Some("b:2".to_string()));
    }

    #[test]
    fn test_cursor_survives_list_shrink() {
        let (bal, _) = balancer();
        let five = addrs(&["a:1", "b:2", "c:3", "d:4", "e:5"]);
        for _ in 0..4 {
            bal.select("svc", &five);
        }
        // Cursor is now 4; the list shrinks to 2 entries.
        let two = addrs(&["a:1", "b:2"]);
        let chosen = bal.select("svc", &two).unwrap();
        assert!(two.contains(&chosen));
    }

    #[test]
    fn test_cooldown_skips_failed_endpoint() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        assert_eq!(bal.select("svc", &endpoints), Some("a:1".to_string()));
        bal.record_failure("a:1");
        // The cursor points at b anyway, but a full rotation must keep
        // skipping a while it cools down.
        assert_eq!(bal.select("svc", &endpoints), Some("b:2".to_string()));
        assert_eq!(bal.select("svc", &endpoints), Some("b:2".to_string()));
    }

    #[test]
    fn test_cooldown_expires() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        let t0 = Instant::now();
        bal.select_at("svc", &endpoints, t0);
        bal.record_failure_at("a:1", t0);
        assert_eq!(bal.select_at("svc", &endpoints, t0), Some("b:2".to_string()));
        // After the cooldown window the endpoint is selectable again.
        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(bal.select_at("svc", &endpoints, t1), Some("a:1".to_string()));
    }

    #[test]
    fn test_probe_recovery_clears_cooldown() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        let t0 = Instant::now();
        bal.record_failure_at("a:1", t0);
        assert!(bal.record_probe("a:1", true));
        // Cooldown cleared early by the UP probe.
        assert_eq!(bal.select_at("svc", &endpoints, t0), Some("a:1".to_string()));
    }

    #[test]
    fn test_known_down_skipped_in_preferred_pass() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        bal.record_probe("a:1", false);
        bal.record_probe("b:2", true);
        assert_eq!(bal.select("svc", &endpoints), Some("b:2".to_string()));
        assert_eq!(bal.select("svc", &endpoints), Some("b:2".to_string()));
    }

    #[test]
    fn test_all_down_still_selects_in_relaxed_pass() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        bal.record_probe("a:1", false);
        bal.record_probe("b:2", false);
        // Nothing survives the preferred pass; the relaxed pass ignores
        // health and hands out the cursor endpoint.
        assert_eq!(bal.select("svc", &endpoints), Some("a:1".to_string()));
    }

    #[test]
    fn test_probe_flip_detection() {
        let (bal, _) = balancer();
        assert!(bal.record_probe("a:1", true), "first sight counts as a change");
        assert!(!bal.record_probe("a:1", true));
        assert!(bal.record_probe("a:1", false));
        assert!(!bal.record_probe("a:1", false));
    }

    #[test]
    fn test_breaker_trips_and_blocks_sole_endpoint() {
        let (bal, metrics) = balancer();
        let endpoints = addrs(&["a:1"]);
        let t0 = Instant::now();
        for _ in 0..3 {
            bal.record_failure_at("a:1", t0);
        }
        // Open breaker: even the last-resort pass refuses the endpoint.
        assert_eq!(bal.select_at("svc", &endpoints, t0), None);
        assert_eq!(
            metrics
                .circuit_breaker_transitions_total
                .with_label_values(&["a:1", "open"])
                .get(),
            1
        );
    }

    #[test]
    fn test_breaker_below_threshold_does_not_trip() {
        let (bal, metrics) = balancer();
        let t0 = Instant::now();
        bal.record_failure_at("a:1", t0);
        bal.record_failure_at("a:1", t0);
        assert_eq!(
            metrics
                .circuit_breaker_transitions_total
                .with_label_values(&["a:1", "open"])
                .get(),
            0
        );
        // Still selectable once the cooldown passes.
        let endpoints = addrs(&["a:1"]);
        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(bal.select_at("svc", &endpoints, t1), Some("a:1".to_string()));
    }

    #[test]
    fn test_open_endpoint_skipped_while_other_serves() {
        let (bal, _) = balancer();
        let endpoints = addrs(&["a:1", "b:2"]);
        let t0 = Instant::now();
        for _ in 0..3 {
            bal.record_failure_at("a:1", t0);
        }
        for _ in 0..4 {
            assert_eq!(bal.select_at("svc", &endpoints, t0), Some("b:2".to_string()));
        }
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let (bal, metrics) = balancer();
        let endpoints = addrs(&["a:1"]);
        let t0 = Instant::now();
        for _ in 0..3 {
            bal.record_failure_at("a:1", t0);
        }
        // Past the open window (cooldown is ignored by the last resort).
        let t1 = t0 + Duration::from_secs(21);
        assert_eq!(bal.select_at("svc", &endpoints, t1), Some("a:1".to_string()));
        assert_eq!(
            metrics
                .circuit_breaker_transitions_total
                .with_label_values(&["a:1", "half_open"])
                .get(),
            1
        );
        // The single trial is consumed; a second selection finds nothing.
        assert_eq!(bal.select_at("svc", &endpoints, t1), None);
    }

    #[test]
    fn test_half_open_success_closes() {
        let (bal, metrics) = balancer();
        let endpoints = addrs(&["a:1"]);
        let t0 = Instant::now();
        for _ in 0..3 {
            bal.record_failure_at("a:1", t0);
        }
        let t1 = t0 + Duration::from_secs(21);
        bal.select_at("svc", &endpoints, t1);
        bal.record_success("a:1");
        assert_eq!(
            metrics
                .circuit_breaker_transitions_total
                .with_label_values(&["a:1", "closed"])
                .get(),
            1
        );
        // Closed again: selection flows normally.
        let t2 = t1 + Duration::from_secs(31);
        assert_eq!(bal.select_at("svc", &endpoints, t2), Some("a:1".to_string()));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (bal, metrics) = balancer();
        let endpoints = addrs(&["a:1"]);
        let t0 = Instant::now();
        for _ in 0..3 {
            bal.record_failure_at("a:1", t0);
        }
        let t1 = t0 + Duration::from_secs(21);
        bal.select_at("svc", &endpoints, t1);
        bal.record_failure_at("a:1", t1);
        assert_eq!(
            metrics
                .circuit_breaker_transitions_total
                .with_label_values(&["a:1", "open"])
                .get(),
            2
        );
        assert_eq!(bal.select_at("svc", &endpoints, t1 + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_sync_service_snapshot() {
        let (bal, _) = balancer();
        bal.sync_service("svc", &addrs(&["a:1", "b:2"]));
        bal.sync_service("other", &addrs(&["c:3"]));
        let mut snapshot = bal.snapshot_services();
        snapshot.sort();
        assert_eq!(
            snapshot,
            vec![
                ("other".to_string(), addrs(&["c:3"])),
                ("svc".to_string(), addrs(&["a:1", "b:2"])),
            ]
        );
    }

    #[test]
    fn test_concurrent_selection_unique_survivors() {
        use std::thread;

        let (bal, _) = balancer();
        let bal = Arc::new(bal);
        let endpoints = Arc::new(addrs(&["a:1", "b:2", "c:3", "d:4"]));

        let mut handles = vec![];
        for _ in 0..8 {
            let bal = Arc::clone(&bal);
            let endpoints = Arc::clone(&endpoints);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    assert!(bal.select("svc", &endpoints).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
