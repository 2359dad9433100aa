//! Pending operation tracking and the per-operation driver.
//!
//! `dispatch` validates a request synchronously, registers it, and spawns a
//! driver task on the registry's [`TaskTracker`]. The driver races the
//! attempt loop against user cancellation, the deadline and shutdown; the
//! first path to claim the operation's [`OperationControl`] decides the
//! outcome. The losing futures are dropped before the callback fires, so
//! by the time the caller sees a result no attempt for that operation is
//! still running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::cancel::{CancelReason, OperationControl, OperationHandle};
use crate::circuitbreaker::{BreakerRegistry, CallOutcome};
use crate::dispatcher::{AttemptContext, Transport};
use crate::error::{CoreError, Result};
use crate::request::{OperationRequest, OperationResponse};
use crate::retry::{AttemptFailure, GiveUp, RetryAction, RetryOrchestrator, RetryReason, TargetPreference};
use crate::topology::{NodeId, Selection, TopologyManager};
use crate::tracer::{RequestSpan, RequestTracer, SpanOutcome};

/// Collaborators the registry drives operations through.
pub struct RegistryParts {
    /// Current cluster map.
    pub topology: Arc<TopologyManager>,
    /// Per-(node, service) breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Retry decisions.
    pub retry: RetryOrchestrator,
    /// Performs attempts.
    pub transport: Arc<dyn Transport>,
    /// Per-operation spans.
    pub tracer: Arc<dyn RequestTracer>,
    /// Tracker for drivers and the tasks they start.
    pub tasks: TaskTracker,
    /// Agent-wide shutdown signal.
    pub shutdown: CancellationToken,
}

struct RegistryInner {
    topology: Arc<TopologyManager>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryOrchestrator,
    transport: Arc<dyn Transport>,
    tracer: Arc<dyn RequestTracer>,
    pending: DashMap<u64, Arc<OperationControl>>,
    next_id: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Accepts operations and drives each to exactly one settlement.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
}

impl OperationRegistry {
    /// Creates a registry.
    pub fn new(parts: RegistryParts) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                topology: parts.topology,
                breakers: parts.breakers,
                retry: parts.retry,
                transport: parts.transport,
                tracer: parts.tracer,
                pending: DashMap::new(),
                next_id: AtomicU64::new(0),
                tasks: parts.tasks,
                shutdown: parts.shutdown,
            }),
        }
    }

    /// Submits `request`; `callback` runs exactly once with the outcome.
    ///
    /// Returns an error without invoking `callback` when the request is
    /// rejected up front: invalid request, no topology yet (unless the
    /// request waits for one), no node offering the service, or shutdown.
    pub fn dispatch<F>(&self, request: OperationRequest, callback: F) -> Result<OperationHandle>
    where
        F: FnOnce(Result<OperationResponse>) + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::Shutdown);
        }
        request.validate()?;
        match self.inner.topology.current() {
            None if !request.waits_for_topology() => return Err(CoreError::TopologyUnavailable),
            Some(snapshot) if !snapshot.offers(request.service()) => {
                return Err(CoreError::ServiceNotAvailable {
                    service: request.service().to_string(),
                })
            }
            _ => {}
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let control = Arc::new(OperationControl::new(id));
        self.inner.pending.insert(id, control.clone());

        let mut span = self.inner.tracer.start_span(request.name(), id);
        span.set_attribute("service", request.service().to_string());
        trace!(op_id = id, op = %request.name(), "operation dispatched");

        let handle = OperationHandle::new(control.clone());
        self.inner
            .tasks
            .spawn(drive(self.inner.clone(), control, request, span, callback));
        Ok(handle)
    }

    /// Submits `request` and waits for its outcome.
    ///
    /// Dropping the returned future cancels the operation.
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResponse> {
        let (tx, rx) = oneshot::channel();
        let handle = self.dispatch(request, move |result| {
            let _ = tx.send(result);
        })?;
        let _guard = CancelOnDrop(handle);
        rx.await.unwrap_or(Err(CoreError::RequestCanceled))
    }

    /// Operations accepted but not yet settled.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Tasks still running: drivers plus row producers.
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Preempts every pending operation with `reason`. Returns how many
    /// were preempted by this call.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let controls: Vec<_> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let canceled = controls
            .iter()
            .filter(|control| control.try_preempt(reason))
            .count();
        debug!(canceled, %reason, "canceled pending operations");
        canceled
    }
}

struct CancelOnDrop(OperationHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn drive<F>(
    inner: Arc<RegistryInner>,
    control: Arc<OperationControl>,
    request: OperationRequest,
    span: Box<dyn RequestSpan>,
    callback: F,
) where
    F: FnOnce(Result<OperationResponse>) + Send + 'static,
{
    let in_flight: Mutex<Option<NodeId>> = Mutex::new(None);
    let external = request.cancel_token().cloned();
    let user_canceled = async move {
        match external {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    // Preemption is checked before the attempt loop is polled, so an
    // already-expired deadline settles without any I/O.
    let result = tokio::select! {
        biased;
        _ = control.token().cancelled() => Err(control.preempted_error()),
        _ = user_canceled => preempt(&control, CancelReason::UserRequested).await,
        _ = inner.shutdown.cancelled() => preempt(&control, CancelReason::Shutdown).await,
        _ = tokio::time::sleep_until(request.deadline().instant()) => {
            // The attempt still waiting on a node counts against it.
            let abandoned = in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(node) = abandoned {
                debug!(op_id = control.id(), node = %node, "attempt timed out in flight");
                inner.breakers.report(&node, request.service(), CallOutcome::Failure);
            }
            preempt(&control, CancelReason::DeadlineExceeded).await
        }
        outcome = run_attempts(&inner, &control, &request, &in_flight) => {
            if control.try_claim() {
                outcome
            } else {
                control.token().cancelled().await;
                Err(control.preempted_error())
            }
        }
    };

    let mut span = span;
    span.set_attribute("attempts", control.attempts().to_string());
    span.end(match &result {
        Ok(_) => SpanOutcome::Success,
        Err(e) => SpanOutcome::Failed(e.kind()),
    });
    inner.pending.remove(&control.id());
    let _settled = SettleOnDrop(&control);
    debug!(
        op_id = control.id(),
        op = %request.name(),
        attempts = control.attempts(),
        ok = result.is_ok(),
        "operation settled"
    );
    callback(result);
}

/// Completes settlement even if the callback unwinds.
struct SettleOnDrop<'a>(&'a OperationControl);

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.mark_settled();
    }
}

async fn preempt(control: &OperationControl, reason: CancelReason) -> Result<OperationResponse> {
    // Losing the claim means another preempting path won; its token fires
    // once its reason is recorded.
    control.try_preempt(reason);
    control.token().cancelled().await;
    Err(control.preempted_error())
}

async fn run_attempts(
    inner: &RegistryInner,
    control: &OperationControl,
    request: &OperationRequest,
    in_flight: &Mutex<Option<NodeId>>,
) -> Result<OperationResponse> {
    let service = request.service();
    let mut preferred: Option<NodeId> = None;
    let mut round: u32 = 0;

    loop {
        let snapshot = match inner.topology.current() {
            Some(snapshot) => snapshot,
            None => {
                inner.topology.wait_for_newer(None).await;
                continue;
            }
        };
        round += 1;

        let selection = inner.topology.select(
            &snapshot,
            service,
            request.routing_key(),
            preferred.as_ref(),
            &inner.breakers,
        );
        let failure = match selection {
            Selection::Target(target) => {
                let attempt = control.next_attempt();
                let ctx = AttemptContext {
                    op_id: control.id(),
                    attempt,
                    deadline: request.deadline(),
                    tasks: inner.tasks.clone(),
                    shutdown: inner.shutdown.clone(),
                };
                *in_flight.lock().unwrap_or_else(|e| e.into_inner()) = Some(target.node.clone());
                let result = inner.transport.execute(&target, request, &ctx).await;
                in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
                match result {
                    Ok(response) => {
                        inner.breakers.report(&target.node, service, CallOutcome::Success);
                        return Ok(response);
                    }
                    Err(failure) => {
                        if let Some(outcome) = failure.breaker_outcome() {
                            inner.breakers.report(&target.node, service, outcome);
                        }
                        failure
                    }
                }
            }
            Selection::CircuitOpen(node) => AttemptFailure::retryable(
                RetryReason::CircuitOpen,
                CoreError::CircuitOpen {
                    node: node.to_string(),
                    service: service.to_string(),
                },
            )
            .on_node(node),
            Selection::Unmapped { vbucket } => AttemptFailure::retryable(
                RetryReason::NodeUnreachable,
                CoreError::TransportFailure {
                    addr: format!("vbucket {}", vbucket),
                    reason: "no active node for vbucket".to_string(),
                },
            ),
            Selection::NoCandidates => {
                return Err(CoreError::ServiceNotAvailable {
                    service: service.to_string(),
                })
            }
        };

        match inner.retry.classify(request, round, &failure, Instant::now()) {
            RetryAction::RetryNow { target } => {
                preferred = prefer(target, &failure);
            }
            RetryAction::RetryAfter { delay, target } => {
                preferred = prefer(target, &failure);
                tokio::time::sleep(delay).await;
            }
            RetryAction::RetryOnNewTopology => {
                preferred = None;
                inner
                    .topology
                    .wait_for_newer(Some(snapshot.revision()))
                    .await;
            }
            RetryAction::DoNotRetry(GiveUp::DeadlineExhausted) => {
                return Err(CoreError::Timeout {
                    attempts: control.attempts(),
                })
            }
            RetryAction::DoNotRetry(GiveUp::NotRetryable) => return Err(failure.error),
        }
    }
}

fn prefer(target: TargetPreference, failure: &AttemptFailure) -> Option<NodeId> {
    match target {
        TargetPreference::SameNode => failure.node.clone(),
        TargetPreference::Reselect => None,
    }
}
