//! Per-(node, service) circuit breakers.
//!
//! A breaker starts **closed** and counts outcomes through a pluggable
//! [`TripPolicy`]. When the policy trips, the breaker goes **open** and
//! rejects every request without touching the network. After the cooldown
//! the next request is admitted as a single **half-open** probe: success
//! closes the breaker, failure reopens it with a longer cooldown.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::topology::{NodeId, ServiceKind};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through; outcomes are counted.
    Closed,
    /// Requests are rejected until the cooldown elapses.
    Open,
    /// One probe request is in flight to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }
}

/// Outcome of one attempt, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The node answered.
    Success,
    /// The node failed in a way that implicates its health.
    Failure,
}

/// Decides when a closed breaker should open.
pub trait TripPolicy: Send + fmt::Debug {
    /// Records an outcome observed while closed.
    fn record(&mut self, outcome: CallOutcome, now: Instant);
    /// Returns `true` if the breaker should open.
    fn should_trip(&self, now: Instant) -> bool;
    /// Clears all counters.
    fn reset(&mut self);
}

/// Opens after `threshold` consecutive failures.
#[derive(Debug, Clone)]
pub struct ConsecutiveFailures {
    threshold: u32,
    failures: u32,
}

impl ConsecutiveFailures {
    /// Creates the policy.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
        }
    }
}

impl TripPolicy for ConsecutiveFailures {
    fn record(&mut self, outcome: CallOutcome, _now: Instant) {
        match outcome {
            CallOutcome::Success => self.failures = 0,
            CallOutcome::Failure => self.failures = self.failures.saturating_add(1),
        }
    }

    fn should_trip(&self, _now: Instant) -> bool {
        self.failures >= self.threshold
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Opens when the failure percentage within a time window reaches a
/// threshold, once the window has seen enough volume.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window: Duration,
    volume_threshold: u32,
    error_percentage: u32,
    window_start: Option<Instant>,
    total: u32,
    failed: u32,
}

impl RollingWindow {
    /// Creates the policy.
    pub fn new(window: Duration, volume_threshold: u32, error_percentage: u32) -> Self {
        Self {
            window,
            volume_threshold: volume_threshold.max(1),
            error_percentage: error_percentage.min(100),
            window_start: None,
            total: 0,
            failed: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) <= self.window => {}
            _ => {
                self.window_start = Some(now);
                self.total = 0;
                self.failed = 0;
            }
        }
    }
}

impl TripPolicy for RollingWindow {
    fn record(&mut self, outcome: CallOutcome, now: Instant) {
        self.roll(now);
        self.total = self.total.saturating_add(1);
        if outcome == CallOutcome::Failure {
            self.failed = self.failed.saturating_add(1);
        }
    }

    fn should_trip(&self, now: Instant) -> bool {
        let in_window = self
            .window_start
            .map(|start| now.saturating_duration_since(start) <= self.window)
            .unwrap_or(false);
        if !in_window || self.total < self.volume_threshold {
            return false;
        }
        u64::from(self.failed) * 100 >= u64::from(self.error_percentage) * u64::from(self.total)
    }

    fn reset(&mut self) {
        self.window_start = None;
        self.total = 0;
        self.failed = 0;
    }
}

/// Which [`TripPolicy`] new breakers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripPolicyKind {
    /// [`ConsecutiveFailures`] with `failure_threshold`.
    ConsecutiveFailures,
    /// [`RollingWindow`] with `rolling_window_ms`, `volume_threshold` and
    /// `error_threshold_percentage`.
    RollingWindow,
}

/// Circuit breaker configuration, shared by every breaker in a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// When `false`, every request is admitted.
    pub enabled: bool,
    /// Trip policy.
    pub policy: TripPolicyKind,
    /// Consecutive failures to open (default: 5).
    pub failure_threshold: u32,
    /// Minimum attempts in the window before it may trip (default: 20).
    pub volume_threshold: u32,
    /// Failure percentage that trips the window (default: 50).
    pub error_threshold_percentage: u32,
    /// Rolling window length (default: 60s).
    pub rolling_window_ms: u64,
    /// Initial cooldown before a half-open probe (default: 5s).
    pub sleep_window_ms: u64,
    /// Cap on the cooldown after repeated probe failures (default: 60s).
    pub max_sleep_window_ms: u64,
    /// Cooldown multiplier applied on each failed probe (default: 2.0).
    pub sleep_window_backoff: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: TripPolicyKind::RollingWindow,
            failure_threshold: 5,
            volume_threshold: 20,
            error_threshold_percentage: 50,
            rolling_window_ms: 60_000,
            sleep_window_ms: 5_000,
            max_sleep_window_ms: 60_000,
            sleep_window_backoff: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Initial cooldown.
    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.sleep_window_ms)
    }

    /// Cooldown cap.
    pub fn max_sleep_window(&self) -> Duration {
        Duration::from_millis(self.max_sleep_window_ms.max(self.sleep_window_ms))
    }

    fn build_policy(&self) -> Box<dyn TripPolicy> {
        match self.policy {
            TripPolicyKind::ConsecutiveFailures => {
                Box::new(ConsecutiveFailures::new(self.failure_threshold))
            }
            TripPolicyKind::RollingWindow => Box::new(RollingWindow::new(
                Duration::from_millis(self.rolling_window_ms),
                self.volume_threshold,
                self.error_threshold_percentage,
            )),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    policy: Box<dyn TripPolicy>,
    open_until: Option<Instant>,
    cooldown: Duration,
    probe_started: Option<Instant>,
}

/// A single circuit breaker.
///
/// The state is mirrored in an atomic so the closed-state admission check
/// never takes the lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    label: String,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Creates a closed breaker. `label` identifies it in logs.
    pub fn new(label: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerInner {
            policy: config.build_policy(),
            open_until: None,
            cooldown: config.sleep_window(),
            probe_started: None,
        };
        Self {
            label: label.into(),
            state: AtomicU8::new(STATE_CLOSED),
            inner: Mutex::new(inner),
            config,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` if a request may be sent now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Admission check at `now`. An open breaker whose cooldown elapsed
    /// admits exactly one probe and moves to half-open.
    pub fn allow_at(&self, now: Instant) -> bool {
        if self.state() == CircuitState::Closed {
            return true;
        }
        let mut inner = self.lock();
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let ready = inner.open_until.map(|t| now >= t).unwrap_or(true);
                if ready {
                    inner.probe_started = Some(now);
                    self.set_state(CircuitState::HalfOpen);
                    debug!(breaker = %self.label, "admitting half-open probe");
                }
                ready
            }
            CircuitState::HalfOpen => {
                // A probe whose outcome was never reported must not wedge
                // the breaker; after another cooldown a new probe goes out.
                let stale = inner
                    .probe_started
                    .map(|t| now.saturating_duration_since(t) >= inner.cooldown)
                    .unwrap_or(true);
                if stale {
                    inner.probe_started = Some(now);
                }
                stale
            }
        }
    }

    /// Reports the outcome of an admitted request.
    pub fn report(&self, outcome: CallOutcome) {
        self.report_at(outcome, Instant::now());
    }

    /// Same as [`CircuitBreaker::report`], observed at `now`.
    pub fn report_at(&self, outcome: CallOutcome, now: Instant) {
        let mut inner = self.lock();
        match self.state() {
            CircuitState::Closed => {
                inner.policy.record(outcome, now);
                if inner.policy.should_trip(now) {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => match outcome {
                CallOutcome::Success => {
                    inner.policy.reset();
                    inner.open_until = None;
                    inner.probe_started = None;
                    inner.cooldown = self.config.sleep_window();
                    self.set_state(CircuitState::Closed);
                    info!(breaker = %self.label, "circuit closed after successful probe");
                }
                CallOutcome::Failure => {
                    let next = inner.cooldown.mul_f64(self.config.sleep_window_backoff.max(1.0));
                    inner.cooldown = next.min(self.config.max_sleep_window());
                    self.open(&mut inner, now);
                }
            },
            // Late results from requests admitted before the trip.
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker closed and clears its counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.policy.reset();
        inner.open_until = None;
        inner.probe_started = None;
        inner.cooldown = self.config.sleep_window();
        self.set_state(CircuitState::Closed);
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.policy.reset();
        inner.probe_started = None;
        inner.open_until = Some(now + inner.cooldown);
        self.set_state(CircuitState::Open);
        warn!(
            breaker = %self.label,
            cooldown_ms = inner.cooldown.as_millis() as u64,
            "circuit opened"
        );
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Breakers keyed by (node, service), created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<(NodeId, ServiceKind), Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates an empty registry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for (node, service), creating it if needed.
    pub fn breaker(&self, node: &NodeId, service: ServiceKind) -> Arc<CircuitBreaker> {
        let key = (node.clone(), service);
        if let Some(breaker) = self.breakers.get(&key) {
            return breaker.clone();
        }
        self.breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("{}/{}", node, service),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Admission check for (node, service).
    pub fn allow(&self, node: &NodeId, service: ServiceKind) -> bool {
        if !self.config.enabled {
            return true;
        }
        self.breaker(node, service).allow()
    }

    /// Reports an outcome for (node, service).
    pub fn report(&self, node: &NodeId, service: ServiceKind, outcome: CallOutcome) {
        if !self.config.enabled {
            return;
        }
        self.breaker(node, service).report(outcome);
    }

    /// Current state for (node, service); closed if never used.
    pub fn state(&self, node: &NodeId, service: ServiceKind) -> CircuitState {
        self.breakers
            .get(&(node.clone(), service))
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Drops breakers for nodes that left the cluster.
    pub fn retain_nodes(&self, live: &[NodeId]) {
        self.breakers.retain(|(node, _), _| live.contains(node));
    }

    /// Number of breakers currently tracked.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns `true` if no breaker has been created yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn consecutive(threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            policy: TripPolicyKind::ConsecutiveFailures,
            failure_threshold: threshold,
            sleep_window_ms: cooldown_ms,
            max_sleep_window_ms: cooldown_ms * 8,
            ..CircuitBreakerConfig::default()
        }
    }

    #[test]
    fn config_default() {
        let config = CircuitBreakerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.policy, TripPolicyKind::RollingWindow);
        assert_eq!(config.volume_threshold, 20);
        assert_eq!(config.error_threshold_percentage, 50);
        assert_eq!(config.sleep_window(), Duration::from_secs(5));
    }

    #[test]
    fn threshold_then_probe_then_close() {
        let breaker = CircuitBreaker::new("n1/query", consecutive(3, 100));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(breaker.allow_at(t0));
            breaker.report_at(CallOutcome::Failure, t0);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_at(t0 + Duration::from_millis(50)));
        assert!(!breaker.allow_at(t0 + Duration::from_millis(99)));

        let after = t0 + Duration::from_millis(100);
        assert!(breaker.allow_at(after));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.allow_at(after));

        breaker.report_at(CallOutcome::Success, after);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_at(after));
    }

    #[test]
    fn success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("n", consecutive(3, 100));
        let now = Instant::now();
        breaker.report_at(CallOutcome::Failure, now);
        breaker.report_at(CallOutcome::Failure, now);
        breaker.report_at(CallOutcome::Success, now);
        breaker.report_at(CallOutcome::Failure, now);
        breaker.report_at(CallOutcome::Failure, now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_probe_reopens_with_longer_cooldown() {
        let breaker = CircuitBreaker::new("n", consecutive(1, 100));
        let t0 = Instant::now();
        breaker.report_at(CallOutcome::Failure, t0);

        let probe = t0 + Duration::from_millis(100);
        assert!(breaker.allow_at(probe));
        breaker.report_at(CallOutcome::Failure, probe);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(!breaker.allow_at(probe + Duration::from_millis(150)));
        assert!(breaker.allow_at(probe + Duration::from_millis(200)));
    }

    #[test]
    fn cooldown_backoff_is_capped() {
        let breaker = CircuitBreaker::new("n", consecutive(1, 100));
        let mut now = Instant::now();
        breaker.report_at(CallOutcome::Failure, now);
        for _ in 0..10 {
            now += Duration::from_secs(10);
            assert!(breaker.allow_at(now));
            breaker.report_at(CallOutcome::Failure, now);
        }
        assert!(breaker.allow_at(now + Duration::from_millis(800)));
    }

    #[test]
    fn unreported_probe_does_not_wedge() {
        let breaker = CircuitBreaker::new("n", consecutive(1, 100));
        let t0 = Instant::now();
        breaker.report_at(CallOutcome::Failure, t0);
        let probe = t0 + Duration::from_millis(100);
        assert!(breaker.allow_at(probe));
        assert!(!breaker.allow_at(probe + Duration::from_millis(50)));
        assert!(breaker.allow_at(probe + Duration::from_millis(100)));
    }

    #[test]
    fn rolling_window_needs_volume() {
        let config = CircuitBreakerConfig {
            volume_threshold: 4,
            error_threshold_percentage: 50,
            rolling_window_ms: 1_000,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new("n", config);
        let now = Instant::now();
        breaker.report_at(CallOutcome::Failure, now);
        breaker.report_at(CallOutcome::Failure, now);
        breaker.report_at(CallOutcome::Failure, now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.report_at(CallOutcome::Success, now);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn rolling_window_expires() {
        let mut policy = RollingWindow::new(Duration::from_millis(100), 2, 50);
        let t0 = Instant::now();
        policy.record(CallOutcome::Failure, t0);
        policy.record(CallOutcome::Failure, t0 + Duration::from_millis(200));
        assert!(!policy.should_trip(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn late_report_while_open_is_ignored() {
        let breaker = CircuitBreaker::new("n", consecutive(1, 100));
        let t0 = Instant::now();
        breaker.report_at(CallOutcome::Failure, t0);
        breaker.report_at(CallOutcome::Success, t0);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_is_keyed_by_node_and_service() {
        let registry = BreakerRegistry::new(consecutive(1, 1_000));
        let a = NodeId::new("a:8091");
        let b = NodeId::new("b:8091");
        registry.report(&a, ServiceKind::Query, CallOutcome::Failure);
        assert!(!registry.allow(&a, ServiceKind::Query));
        assert!(registry.allow(&a, ServiceKind::Kv));
        assert!(registry.allow(&b, ServiceKind::Query));
        assert_eq!(registry.state(&a, ServiceKind::Query), CircuitState::Open);

        registry.retain_nodes(&[b.clone()]);
        assert_eq!(registry.state(&a, ServiceKind::Query), CircuitState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disabled_registry_admits_everything() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig {
            enabled: false,
            ..consecutive(1, 1_000)
        });
        let a = NodeId::new("a:8091");
        registry.report(&a, ServiceKind::Query, CallOutcome::Failure);
        assert!(registry.allow(&a, ServiceKind::Query));
        assert!(registry.is_empty());
    }

    proptest! {
        #[test]
        fn open_breaker_admits_at_most_one_probe(
            threshold in 1u32..6,
            probes in 2usize..20,
        ) {
            let breaker = CircuitBreaker::new("p", consecutive(threshold, 100));
            let t0 = Instant::now();
            for _ in 0..threshold {
                breaker.report_at(CallOutcome::Failure, t0);
            }
            prop_assert_eq!(breaker.state(), CircuitState::Open);
            let at = t0 + Duration::from_millis(100);
            let admitted = (0..probes).filter(|_| breaker.allow_at(at)).count();
            prop_assert_eq!(admitted, 1);
        }
    }
}
