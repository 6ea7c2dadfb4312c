//! Circuit breaker for per-service failure isolation
//!
//! One breaker per service name, created lazily on first reference and kept
//! for the lifetime of the process. Each breaker owns its state behind a
//! single mutex, so concurrent failures for the same service are counted
//! exactly once each and cannot race past the threshold.
//!
//! Only transport failures (connection refused, timeout) are recorded as
//! failures. A backend that answers, whatever the status, is a success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use observability_shared::CircuitBreakerConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Circuit open, requests fail fast
    HalfOpen, // Testing if service is back up
}

impl CircuitState {
    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Thresholds and timings for one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub success_threshold: u32,
}

impl From<&CircuitBreakerConfig> for CircuitPolicy {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold(),
            open_duration: config.open_duration(),
            success_threshold: config.success_threshold(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Bumped on every state transition
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes_half_open: u32,
    last_failure: Option<Instant>,
    /// Set while a half-open probe is outstanding
    probe_started: Option<Instant>,
}

impl BreakerInner {
    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Ticket for a call the breaker let through. Outcomes reported with a
/// ticket from an earlier state are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    generation: u64,
}

/// Circuit breaker for a single service
#[derive(Debug)]
pub struct CircuitBreaker {
    service_name: String,
    policy: CircuitPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, policy: CircuitPolicy) -> Self {
        Self {
            service_name: service_name.into(),
            policy,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                consecutive_failures: 0,
                consecutive_successes_half_open: 0,
                last_failure: None,
                probe_started: None,
            }),
        }
    }

    /// Check if a request to the service may proceed
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        self.admit_at(now).is_some()
    }

    /// Same check as [`CircuitBreaker::allow`], returning the ticket the
    /// caller hands back with the outcome.
    pub fn admit(&self) -> Option<Admission> {
        self.admit_at(Instant::now())
    }

    /// An open breaker whose window has elapsed moves to half-open here. In
    /// half-open one probe is admitted at a time; a probe that never reports
    /// back is considered lost after another open window.
    pub fn admit_at(&self, now: Instant) -> Option<Admission> {
        let mut inner = self.inner.lock();

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(self.policy.open_duration);

                if elapsed >= self.policy.open_duration {
                    inner.transition(CircuitState::HalfOpen);
                    inner.consecutive_successes_half_open = 0;
                    inner.probe_started = Some(now);
                    info!(service = %self.service_name, "Circuit breaker HALF_OPEN");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.probe_started {
                Some(started)
                    if now.saturating_duration_since(started) < self.policy.open_duration =>
                {
                    false
                }
                _ => {
                    inner.probe_started = Some(now);
                    true
                }
            },
        };

        admitted.then_some(Admission {
            generation: inner.generation,
        })
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.apply_success(&mut inner);
    }

    /// Record the success of an admitted call, unless the breaker changed
    /// state since it was admitted
    pub fn record_success_for(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.generation != admission.generation {
            debug!(service = %self.service_name, "Ignoring success from an earlier breaker state");
            return;
        }
        self.apply_success(&mut inner);
    }

    fn apply_success(&self, inner: &mut BreakerInner) {
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.probe_started = None;
            inner.consecutive_successes_half_open += 1;

            if inner.consecutive_successes_half_open >= self.policy.success_threshold {
                inner.transition(CircuitState::Closed);
                inner.consecutive_successes_half_open = 0;
                info!(service = %self.service_name, "Circuit breaker CLOSED - recovered");
            }
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        self.apply_failure(&mut inner, now);
    }

    /// Record the failure of an admitted call, unless the breaker changed
    /// state since it was admitted
    pub fn record_failure_for(&self, admission: Admission) {
        self.record_failure_for_at(admission, Instant::now())
    }

    pub fn record_failure_for_at(&self, admission: Admission, now: Instant) {
        let mut inner = self.inner.lock();
        if inner.generation != admission.generation {
            debug!(service = %self.service_name, "Ignoring failure from an earlier breaker state");
            return;
        }
        self.apply_failure(&mut inner, now);
    }

    fn apply_failure(&self, inner: &mut BreakerInner, now: Instant) {
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.consecutive_successes_half_open = 0;
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                inner.probe_started = None;
                warn!(service = %self.service_name, "Circuit breaker re-OPENED - probe failed");
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.policy.failure_threshold {
                    inner.transition(CircuitState::Open);
                    warn!(
                        service = %self.service_name,
                        failures = inner.consecutive_failures,
                        threshold = self.policy.failure_threshold,
                        "Circuit breaker OPEN - threshold reached"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Whole seconds until the open window elapses, at least 1
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs_at(Instant::now())
    }

    pub fn retry_after_secs_at(&self, now: Instant) -> u64 {
        let inner = self.inner.lock();
        let since = match inner.state {
            CircuitState::Open => inner.last_failure,
            CircuitState::HalfOpen => inner.probe_started,
            CircuitState::Closed => None,
        };

        let remaining = since
            .map(|t| self.policy.open_duration.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or_default();

        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        secs.max(1)
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            service: self.service_name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes_half_open: inner.consecutive_successes_half_open,
            failure_threshold: self.policy.failure_threshold,
            success_threshold: self.policy.success_threshold,
            open_duration_ms: self.policy.open_duration.as_millis() as u64,
            seconds_since_last_failure: inner.last_failure.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Point-in-time view of a breaker, for the gateway descriptor
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes_half_open: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: u64,
    pub seconds_since_last_failure: Option<u64>,
}

/// Breakers keyed by service name
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing breaker for the service, or a new one built from `policy`
    pub fn get_or_create(&self, service_name: &str, policy: CircuitPolicy) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service_name, policy)))
            .clone()
    }

    pub fn get(&self, service_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(service_name).cloned()
    }

    /// Snapshots of every breaker created so far, sorted by service name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32, open_secs: u64) -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: threshold,
            open_duration: Duration::from_secs(open_secs),
            success_threshold: 2,
        }
    }

    #[test]
    fn test_opens_after_threshold_and_stays_open_for_window() {
        let breaker = CircuitBreaker::new("payment-service", policy(3, 30));
        let start = Instant::now();

        breaker.record_failure_at(start);
        breaker.record_failure_at(start);
        assert!(breaker.allow_at(start));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure_at(start);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_at(start));
        assert!(!breaker.allow_at(start + Duration::from_secs(29)));
        assert_eq!(breaker.retry_after_secs_at(start), 30);
        assert_eq!(breaker.retry_after_secs_at(start + Duration::from_millis(29_500)), 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("order-service", policy(3, 30));
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_one_probe_at_a_time() {
        let breaker = CircuitBreaker::new("product-service", policy(1, 10));
        let start = Instant::now();
        breaker.record_failure_at(start);

        let later = start + Duration::from_secs(10);
        assert!(breaker.allow_at(later));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_at(later));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_at(later));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_at(later));
        assert!(breaker.allow_at(later));
    }

    #[test]
    fn test_failure_in_half_open_reopens_immediately() {
        let breaker = CircuitBreaker::new("invoice-service", policy(2, 5));
        let start = Instant::now();
        breaker.record_failure_at(start);
        breaker.record_failure_at(start);

        let probe_time = start + Duration::from_secs(5);
        assert!(breaker.allow_at(probe_time));
        breaker.record_success();
        breaker.record_failure_at(probe_time);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_at(probe_time + Duration::from_secs(4)));
        assert!(breaker.allow_at(probe_time + Duration::from_secs(5)));
    }

    #[test]
    fn test_lost_probe_is_replaced_after_window() {
        let breaker = CircuitBreaker::new("notification-service", policy(1, 5));
        let start = Instant::now();
        breaker.record_failure_at(start);

        let probe_time = start + Duration::from_secs(5);
        assert!(breaker.allow_at(probe_time));
        assert!(!breaker.allow_at(probe_time + Duration::from_secs(1)));
        assert!(breaker.allow_at(probe_time + Duration::from_secs(5)));
    }

    #[test]
    fn test_late_outcomes_from_closed_state_do_not_count_as_probes() {
        let breaker = CircuitBreaker::new("order-service", policy(1, 10));
        let start = Instant::now();

        let slow_call = breaker.admit_at(start).unwrap();
        let failing_call = breaker.admit_at(start).unwrap();
        breaker.record_failure_for_at(failing_call, start);
        assert_eq!(breaker.state(), CircuitState::Open);

        let later = start + Duration::from_secs(10);
        let probe = breaker.admit_at(later).unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The call admitted while closed finishes during half-open
        breaker.record_success_for(slow_call);
        assert_eq!(breaker.snapshot().consecutive_successes_half_open, 0);
        assert!(!breaker.allow_at(later));

        breaker.record_failure_for_at(slow_call, later);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success_for(probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second_probe = breaker.admit_at(later).unwrap();
        breaker.record_success_for(second_probe);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_concurrent_failures_counted_once_each() {
        let breaker = Arc::new(CircuitBreaker::new("payment-service", policy(1000, 30)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(breaker.consecutive_failures(), 800);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = BreakerRegistry::new();
        let first = registry.get_or_create("order-service", policy(3, 30));
        first.record_failure();

        let second = registry.get_or_create("order-service", policy(99, 99));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().failure_threshold, 3);
        assert!(registry.get("payment-service").is_none());

        registry.get_or_create("alpha-service", policy(3, 30));
        let names: Vec<String> = registry.snapshots().into_iter().map(|s| s.service).collect();
        assert_eq!(names, vec!["alpha-service", "order-service"]);
    }

    #[test]
    fn test_state_serializes_in_screaming_case() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("HALF_OPEN")
        );
    }
}
