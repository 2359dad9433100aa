//! Absolute operation deadlines.
//!
//! Deadlines are expressed against the tokio clock so that timer-driven
//! behavior can be exercised deterministically with a paused runtime.

use std::time::Duration;

use tokio::time::Instant;

/// Far enough in the future to never fire, without overflowing `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Absolute point in time by which an operation must settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Creates a deadline `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self { at }
    }

    /// Creates a deadline at the given instant.
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Returns the deadline as an instant.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Returns the remaining time until the deadline expires.
    ///
    /// Returns `None` if the deadline has already expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Instant::now())
    }

    /// Same as [`Deadline::remaining`], measured from `now`.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        if self.at > now {
            Some(self.at - now)
        } else {
            None
        }
    }

    /// Returns `true` if waiting `delay` from `now` still lands strictly
    /// before the deadline.
    pub fn allows_delay(&self, now: Instant, delay: Duration) -> bool {
        match self.remaining_at(now) {
            Some(remaining) => delay < remaining,
            None => false,
        }
    }

    /// Caps a per-step timeout so it never outlives the deadline.
    pub fn cap(&self, timeout: Duration) -> Duration {
        self.remaining().map(|r| r.min(timeout)).unwrap_or_default()
    }
}
