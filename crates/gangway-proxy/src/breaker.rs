//! Per-endpoint circuit breaker.
//!
//! State transitions:
//!
//! - **Closed → Open**: consecutive failures reach the threshold
//! - **Open → HalfOpen**: checked lazily at the selection site once the
//!   open window elapses; a single trial request is permitted
//! - **HalfOpen → Closed**: the trial succeeds
//! - **HalfOpen → Open**: the trial fails
//!
//! There is no background timer: the Open → HalfOpen edge is taken during
//! endpoint selection, so the breaker does no work when no traffic
//! arrives. The caller is responsible for serializing access to a given
//! endpoint's state (the balancer holds all breakers under one lock).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    /// Normal operation, requests flow through.
    Closed,
    /// Tripped; the endpoint is skipped until the open window elapses.
    Open,
    /// Testing recovery; at most one trial request is admitted.
    HalfOpen,
}

/// A state transition, reported so the caller can emit metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Open,
    HalfOpen,
    Closed,
}

impl Transition {
    pub fn as_label(&self) -> &'static str {
        match self {
            Transition::Open => "open",
            Transition::HalfOpen => "half_open",
            Transition::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is permitted.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(20),
        }
    }
}

/// Breaker state for one endpoint.
#[derive(Debug)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    /// Meaningful only while Open.
    open_until: Option<Instant>,
    /// Meaningful only while HalfOpen.
    trial_permitted: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            open_until: None,
            trial_permitted: false,
        }
    }
}

impl BreakerState {
    /// Records a failure observed by the dispatcher.
    pub fn on_failure(&mut self, now: Instant, config: &BreakerConfig) -> Option<Transition> {
        self.consecutive_failures += 1;
        match self.status {
            BreakerStatus::Closed => {
                if self.consecutive_failures >= config.failure_threshold {
                    self.trip(now, config);
                    return Some(Transition::Open);
                }
                None
            }
            BreakerStatus::HalfOpen => {
                // The trial failed; re-open the circuit.
                self.trip(now, config);
                Some(Transition::Open)
            }
            BreakerStatus::Open => None,
        }
    }

    /// Records a success observed by the dispatcher.
    pub fn on_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        if self.status == BreakerStatus::HalfOpen {
            self.status = BreakerStatus::Closed;
            self.open_until = None;
            self.trial_permitted = false;
            return Some(Transition::Closed);
        }
        None
    }

    /// Consulted during selection. Returns whether the endpoint may be
    /// handed out, plus the Open → HalfOpen transition when the open
    /// window has elapsed.
    ///
    /// An admitted HalfOpen endpoint still holds its trial permit; the
    /// caller consumes it with [`consume_trial`](Self::consume_trial)
    /// only when the endpoint is actually chosen.
    pub fn check_admission(&mut self, now: Instant) -> (bool, Option<Transition>) {
        match self.status {
            BreakerStatus::Closed => (true, None),
            BreakerStatus::Open => {
                match self.open_until {
                    Some(until) if now >= until => {
                        self.status = BreakerStatus::HalfOpen;
                        self.open_until = None;
                        self.trial_permitted = true;
                        (true, Some(Transition::HalfOpen))
                    }
                    _ => (false, None),
                }
            }
            BreakerStatus::HalfOpen => (self.trial_permitted, None),
        }
    }

    /// Consumes the single HalfOpen trial permit.
    pub fn consume_trial(&mut self) {
        if self.status == BreakerStatus::HalfOpen {
            self.trial_permitted = false;
        }
    }

    fn trip(&mut self, now: Instant, config: &BreakerConfig) {
        self.status = BreakerStatus::Open;
        self.open_until = Some(now + config.open_duration);
        self.trial_permitted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_secs(20),
        }
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        assert_eq!(state.on_failure(now, &config()), None);
        assert_eq!(state.on_failure(now, &config()), None);
        assert_eq!(state.status, BreakerStatus::Closed);
        assert_eq!(state.consecutive_failures, 2);
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        state.on_failure(now, &config());
        state.on_failure(now, &config());
        assert_eq!(state.on_failure(now, &config()), Some(Transition::Open));
        assert_eq!(state.status, BreakerStatus::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        state.on_failure(now, &config());
        state.on_failure(now, &config());
        assert_eq!(state.on_success(), None);
        assert_eq!(state.consecutive_failures, 0);
        // The count starts over: two more failures do not trip.
        state.on_failure(now, &config());
        state.on_failure(now, &config());
        assert_eq!(state.status, BreakerStatus::Closed);
    }

    #[test]
    fn test_open_skips_until_window_elapses() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        for _ in 0..3 {
            state.on_failure(now, &config());
        }
        let (allowed, transition) = state.check_admission(now);
        assert!(!allowed);
        assert_eq!(transition, None);
    }

    #[test]
    fn test_half_open_precisely_at_open_until() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        for _ in 0..3 {
            state.on_failure(now, &config());
        }
        // One instant before the boundary: still open.
        let just_before = now + config().open_duration - Duration::from_nanos(1);
        assert_eq!(state.check_admission(just_before), (false, None));
        // At the boundary: half-open, trial permitted.
        let boundary = now + config().open_duration;
        let (allowed, transition) = state.check_admission(boundary);
        assert!(allowed);
        assert_eq!(transition, Some(Transition::HalfOpen));
        assert_eq!(state.status, BreakerStatus::HalfOpen);
    }

    #[test]
    fn test_single_trial_admission() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        for _ in 0..3 {
            state.on_failure(now, &config());
        }
        let later = now + Duration::from_secs(21);
        let (allowed, _) = state.check_admission(later);
        assert!(allowed);
        state.consume_trial();
        // A concurrent selection observes the consumed trial and skips.
        let (allowed, transition) = state.check_admission(later);
        assert!(!allowed);
        assert_eq!(transition, None);
    }

    #[test]
    fn test_trial_success_closes() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        for _ in 0..3 {
            state.on_failure(now, &config());
        }
        state.check_admission(now + Duration::from_secs(21));
        state.consume_trial();
        assert_eq!(state.on_success(), Some(Transition::Closed));
        assert_eq!(state.status, BreakerStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_trial_failure_reopens() {
        let mut state = BreakerState::default();
        let now = Instant::now();
        for _ in 0..3 {
            state.on_failure(now, &config());
        }
        let later = now + Duration::from_secs(21);
        state.check_admission(later);
        state.consume_trial();
        assert_eq!(state.on_failure(later, &config()), Some(Transition::Open));
        assert_eq!(state.status, BreakerStatus::Open);
        // Open again for a full window from the trial failure.
        assert_eq!(state.check_admission(later + Duration::from_secs(19)), (false, None));
        let (allowed, _) = state.check_admission(later + Duration::from_secs(20));
        assert!(allowed);
    }
}
