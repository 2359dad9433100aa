//! Single-fire settlement and cooperative cancellation for pending operations.
//!
//! Every accepted operation owns an [`OperationControl`]. Exactly one of
//! {natural completion, cancellation, deadline expiry, shutdown} wins the
//! `Pending -> Settling` transition; every other path becomes a no-op.
//! The winner's outcome is delivered by the operation's driver task after
//! the in-flight attempt has been dropped and its resources released.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

const STATE_PENDING: u8 = 0;
const STATE_SETTLING: u8 = 1;
const STATE_SETTLED: u8 = 2;

/// Settlement state of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// No path has claimed the settlement yet.
    Pending,
    /// A path has won and the outcome is being delivered.
    Settling,
    /// The completion callback has fired.
    Settled,
}

impl SettleState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_SETTLING => SettleState::Settling,
            STATE_SETTLED => SettleState::Settled,
            _ => SettleState::Pending,
        }
    }
}

/// Why an operation was preempted before it completed naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller canceled through its handle or its own token.
    UserRequested,
    /// The operation's deadline elapsed.
    DeadlineExceeded,
    /// The owning agent is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Compare-and-swap gate deciding which settlement path wins.
#[derive(Debug)]
pub struct SettleGuard {
    state: AtomicU8,
}

impl SettleGuard {
    /// Creates a guard in the pending state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_PENDING),
        }
    }

    /// Attempts the `Pending -> Settling` transition.
    ///
    /// Returns `true` for exactly one caller over the guard's lifetime.
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_PENDING,
                STATE_SETTLING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks the settlement as delivered.
    pub fn complete(&self) {
        self.state.store(STATE_SETTLED, Ordering::Release);
    }

    /// Returns the current settlement state.
    pub fn state(&self) -> SettleState {
        SettleState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl Default for SettleGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared tracking state of one pending operation.
#[derive(Debug)]
pub struct OperationControl {
    id: u64,
    guard: SettleGuard,
    attempts: AtomicU32,
    preempted: Mutex<Option<CancelReason>>,
    token: CancellationToken,
}

impl OperationControl {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            guard: SettleGuard::new(),
            attempts: AtomicU32::new(0),
            preempted: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    /// Unique operation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Returns the current settlement state.
    pub fn state(&self) -> SettleState {
        self.guard.state()
    }

    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Claims the settlement for natural completion.
    pub(crate) fn try_claim(&self) -> bool {
        self.guard.try_claim()
    }

    /// Claims the settlement for a preempting path and wakes the driver.
    ///
    /// Returns `false` if another path already won.
    pub(crate) fn try_preempt(&self, reason: CancelReason) -> bool {
        if !self.guard.try_claim() {
            return false;
        }
        *self
            .preempted
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.token.cancel();
        true
    }

    /// Error delivered when a preempting path won.
    pub(crate) fn preempted_error(&self) -> CoreError {
        let reason = *self.preempted.lock().unwrap_or_else(|e| e.into_inner());
        match reason {
            Some(CancelReason::DeadlineExceeded) => CoreError::Timeout {
                attempts: self.attempts(),
            },
            Some(CancelReason::Shutdown) => CoreError::Shutdown,
            Some(CancelReason::UserRequested) | None => CoreError::RequestCanceled,
        }
    }

    pub(crate) fn mark_settled(&self) {
        self.guard.complete();
    }
}

/// Caller-facing cancellation handle returned by dispatch.
///
/// `cancel()` may be called any number of times from any thread; it is a
/// no-op once the operation has settled.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    control: std::sync::Arc<OperationControl>,
}

impl OperationHandle {
    pub(crate) fn new(control: std::sync::Arc<OperationControl>) -> Self {
        Self { control }
    }

    /// Operation id, matching the id reported to the tracer.
    pub fn id(&self) -> u64 {
        self.control.id()
    }

    /// Requests cancellation. Returns `true` if this call won the settlement.
    pub fn cancel(&self) -> bool {
        self.control.try_preempt(CancelReason::UserRequested)
    }

    /// Returns `true` once the completion callback has fired.
    pub fn is_settled(&self) -> bool {
        self.control.state() == SettleState::Settled
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.control.attempts()
    }
}
