//! Failure classification and retry decisions.
//!
//! [`RetryOrchestrator::classify`] is a pure function of the request's
//! policy, the attempt count, the failure and the current time. It never
//! performs I/O; the registry's driver acts on the [`RetryAction`] it
//! returns. The deadline is the only hard stop: there is no attempt cap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::circuitbreaker::CallOutcome;
use crate::error::CoreError;
use crate::request::OperationRequest;
use crate::topology::NodeId;

/// Why an attempt failed, for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// No usable connection to the node; nothing was sent.
    SocketNotAvailable,
    /// The node could not be reached, or no node owns the key right now.
    NodeUnreachable,
    /// The node's breaker rejected the attempt; nothing was sent.
    CircuitOpen,
    /// The node no longer owns the data; wait for a newer topology.
    TopologyStale,
    /// The node asked the client to back off.
    NodeOverloaded,
    /// The service reported a transient outage.
    ServiceTemporarilyUnavailable,
    /// The document is locked or has a durable write in progress.
    ConflictingWriteInProgress,
    /// A cached query plan was invalidated on the server.
    PreparedStatementFailure,
    /// The connection closed after the request was written.
    SocketClosedInFlight,
    /// The node sent a response that could not be decoded.
    MalformedResponse,
}

impl RetryReason {
    /// Returns `true` if the request provably did not take effect, so a
    /// non-idempotent operation may be retried.
    pub fn allows_non_idempotent_retry(&self) -> bool {
        !matches!(
            self,
            RetryReason::SocketClosedInFlight | RetryReason::MalformedResponse
        )
    }

    /// Returns `true` for reasons retried regardless of strategy, using the
    /// controlled backoff schedule.
    pub fn always_retry(&self) -> bool {
        matches!(
            self,
            RetryReason::SocketNotAvailable | RetryReason::CircuitOpen | RetryReason::TopologyStale
        )
    }

    /// Returns `true` if the retry should block until a newer topology is
    /// published instead of backing off.
    pub fn waits_for_topology(&self) -> bool {
        matches!(self, RetryReason::TopologyStale)
    }

    /// Returns `true` if the failure says something about the node itself,
    /// so a retry should not insist on the same node.
    pub fn implicates_node(&self) -> bool {
        matches!(
            self,
            RetryReason::SocketNotAvailable
                | RetryReason::NodeUnreachable
                | RetryReason::CircuitOpen
                | RetryReason::NodeOverloaded
                | RetryReason::ServiceTemporarilyUnavailable
                | RetryReason::SocketClosedInFlight
                | RetryReason::MalformedResponse
        )
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed attempt, as handed from the transport to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    /// Retry classification; `None` means the error is terminal.
    pub reason: Option<RetryReason>,
    /// Error surfaced if the operation gives up on this failure.
    pub error: CoreError,
    /// Node the attempt was addressed to, if one was chosen.
    pub node: Option<NodeId>,
}

impl AttemptFailure {
    /// A failure the orchestrator may retry.
    pub fn retryable(reason: RetryReason, error: CoreError) -> Self {
        Self {
            reason: Some(reason),
            error,
            node: None,
        }
    }

    /// A terminal failure.
    pub fn fatal(error: CoreError) -> Self {
        Self {
            reason: None,
            error,
            node: None,
        }
    }

    /// Attaches the node the attempt was sent to.
    pub fn on_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// What this failure tells the node's breaker, if anything.
    pub fn breaker_outcome(&self) -> Option<CallOutcome> {
        match self.reason {
            Some(RetryReason::NodeUnreachable)
            | Some(RetryReason::NodeOverloaded)
            | Some(RetryReason::SocketClosedInFlight)
            | Some(RetryReason::MalformedResponse) => Some(CallOutcome::Failure),
            Some(RetryReason::CircuitOpen) | Some(RetryReason::SocketNotAvailable) => None,
            _ => Some(CallOutcome::Success),
        }
    }
}

/// Where the next attempt should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPreference {
    /// Stay on the node that served the failed attempt.
    SameNode,
    /// Re-resolve against the latest topology.
    Reselect,
}

/// Why an operation stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    /// The failure or the policy does not allow a retry.
    NotRetryable,
    /// The earliest retry would land at or past the deadline.
    DeadlineExhausted,
}

/// Decision produced by [`RetryOrchestrator::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-dispatch immediately.
    RetryNow {
        /// Target preference for the next attempt.
        target: TargetPreference,
    },
    /// Re-dispatch after `delay`.
    RetryAfter {
        /// Backoff before the next attempt.
        delay: Duration,
        /// Target preference for the next attempt.
        target: TargetPreference,
    },
    /// Re-dispatch once a newer topology has been published.
    RetryOnNewTopology,
    /// Settle with the failure (or `Timeout` when the deadline is exhausted).
    DoNotRetry(GiveUp),
}

/// Whether retries stick to the previous node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAffinity {
    /// Keep the node unless the failure implicates it.
    PreserveWhenNotImplicated,
    /// Always pick a fresh node from the latest topology.
    AlwaysReselect,
}

/// Pluggable retry policy.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Backoff before attempt `attempt + 1`, or `None` to stop retrying.
    fn retry_after(&self, attempt: u32, reason: RetryReason) -> Option<Duration>;

    /// Node affinity for retries.
    fn affinity(&self) -> NodeAffinity {
        NodeAffinity::PreserveWhenNotImplicated
    }
}

/// Exponential backoff with optional jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a backoff schedule.
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: bool) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter,
        }
    }

    /// Delay after `attempt` failed attempts (1-based).
    ///
    /// Computes `initial * multiplier^(attempt - 1)`, adds up to 50% jitter
    /// when enabled, and caps the result at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base_ns = self.initial.as_nanos() as f64;
        let max_ns = self.max.as_nanos() as f64;
        let capped = (base_ns * self.multiplier.powi(exponent)).min(max_ns);
        let total = if self.jitter && capped > 0.0 {
            capped + rand::thread_rng().gen_range(0.0..capped / 2.0)
        } else {
            capped
        };
        Duration::from_nanos(total.min(max_ns) as u64)
    }
}

/// Fixed schedule for reasons that always retry.
fn controlled_backoff(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_millis(1),
        2 => Duration::from_millis(10),
        3 => Duration::from_millis(50),
        4 => Duration::from_millis(100),
        5 => Duration::from_millis(500),
        _ => Duration::from_millis(1_000),
    }
}

/// Retries every transient reason with exponential backoff.
#[derive(Debug, Clone)]
pub struct BestEffortRetryStrategy {
    backoff: ExponentialBackoff,
    affinity: NodeAffinity,
}

impl BestEffortRetryStrategy {
    /// Creates the strategy.
    pub fn new(backoff: ExponentialBackoff, affinity: NodeAffinity) -> Self {
        Self { backoff, affinity }
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        RetryConfig::default().best_effort()
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, attempt: u32, _reason: RetryReason) -> Option<Duration> {
        Some(self.backoff.delay(attempt))
    }

    fn affinity(&self) -> NodeAffinity {
        self.affinity
    }
}

/// Never retries, except for reasons that always retry.
#[derive(Debug, Clone, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _attempt: u32, _reason: RetryReason) -> Option<Duration> {
        None
    }
}

/// Which built-in strategy the agent uses by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
    /// [`BestEffortRetryStrategy`].
    BestEffort,
    /// [`FailFastRetryStrategy`].
    FailFast,
}

/// Process-wide retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default strategy.
    pub strategy: RetryStrategyKind,
    /// First backoff (default: 1ms).
    pub initial_backoff_ms: u64,
    /// Backoff ceiling (default: 500ms).
    pub max_backoff_ms: u64,
    /// Growth factor per attempt (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter (default: true).
    pub jitter: bool,
    /// Node affinity for retries.
    pub node_affinity: NodeAffinity,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::BestEffort,
            initial_backoff_ms: 1,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
            jitter: true,
            node_affinity: NodeAffinity::PreserveWhenNotImplicated,
        }
    }
}

impl RetryConfig {
    /// Backoff schedule described by this config.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
            self.jitter,
        )
    }

    /// Best-effort strategy with this config's backoff and affinity.
    pub fn best_effort(&self) -> BestEffortRetryStrategy {
        BestEffortRetryStrategy::new(self.backoff(), self.node_affinity)
    }

    /// Builds the default strategy.
    pub fn build_strategy(&self) -> Arc<dyn RetryStrategy> {
        match self.strategy {
            RetryStrategyKind::BestEffort => Arc::new(self.best_effort()),
            RetryStrategyKind::FailFast => Arc::new(FailFastRetryStrategy),
        }
    }
}

/// Turns attempt failures into retry decisions.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator {
    default_strategy: Arc<dyn RetryStrategy>,
}

impl RetryOrchestrator {
    /// Creates an orchestrator with a process-wide default strategy.
    pub fn new(default_strategy: Arc<dyn RetryStrategy>) -> Self {
        Self { default_strategy }
    }

    /// Decides what to do after `attempt` attempts have been made and the
    /// last one failed with `failure`.
    pub fn classify(
        &self,
        request: &OperationRequest,
        attempt: u32,
        failure: &AttemptFailure,
        now: Instant,
    ) -> RetryAction {
        let action = self.decide(request, attempt, failure, now);
        debug!(
            op = %request.name(),
            attempt,
            reason = ?failure.reason,
            action = ?action,
            "retry decision"
        );
        action
    }

    fn decide(
        &self,
        request: &OperationRequest,
        attempt: u32,
        failure: &AttemptFailure,
        now: Instant,
    ) -> RetryAction {
        let Some(reason) = failure.reason else {
            return RetryAction::DoNotRetry(GiveUp::NotRetryable);
        };
        if !request.is_idempotent() && !reason.allows_non_idempotent_retry() {
            return RetryAction::DoNotRetry(GiveUp::NotRetryable);
        }

        let deadline = request.deadline();
        if reason.waits_for_topology() {
            return match deadline.remaining_at(now) {
                Some(_) => RetryAction::RetryOnNewTopology,
                None => RetryAction::DoNotRetry(GiveUp::DeadlineExhausted),
            };
        }

        let strategy = request
            .retry_strategy()
            .unwrap_or(&self.default_strategy);
        let delay = if reason.always_retry() {
            Some(controlled_backoff(attempt))
        } else {
            strategy.retry_after(attempt, reason)
        };
        let Some(delay) = delay else {
            return RetryAction::DoNotRetry(GiveUp::NotRetryable);
        };
        if !deadline.allows_delay(now, delay) {
            return RetryAction::DoNotRetry(GiveUp::DeadlineExhausted);
        }

        let target = match strategy.affinity() {
            NodeAffinity::AlwaysReselect => TargetPreference::Reselect,
            NodeAffinity::PreserveWhenNotImplicated if reason.implicates_node() => {
                TargetPreference::Reselect
            }
            NodeAffinity::PreserveWhenNotImplicated => TargetPreference::SameNode,
        };
        if delay.is_zero() {
            RetryAction::RetryNow { target }
        } else {
            RetryAction::RetryAfter { delay, target }
        }
    }
}

impl Default for RetryOrchestrator {
    fn default() -> Self {
        Self::new(RetryConfig::default().build_strategy())
    }
}
