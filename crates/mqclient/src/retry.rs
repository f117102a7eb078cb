//! Bounded retry-with-reconnect for broker operations.
//!
//! Every operation whose failure mode includes transient connection loss runs
//! the same loop: classify the native error, and on a transient one close the
//! queue, wait [`RETRY_DELAY`](crate::queue::RETRY_DELAY), reconnect, and try
//! again from the top, up to [`TRY_ATTEMPTS`](crate::queue::TRY_ATTEMPTS)
//! total attempts. Streaming calls re-enter the underlying stream after each
//! reconnect instead of returning a single value; the policy is otherwise
//! identical.

use std::time::Duration;

use tracing::debug;

use crate::error::{MqError, Result};
use crate::queue::{RETRY_DELAY, TRY_ATTEMPTS};

/// How an adapter classifies a backend-native error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection-level; reconnect and retry.
    Transient,
    /// Resource/channel-level; structurally fatal, propagate immediately.
    Fatal,
    /// Operation-specific no-message signal; short-circuit with "no message"
    /// rather than treating it as a failure.
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, initial try included.
    pub attempts: usize,
    /// Pause between closing the failed connection and reconnecting.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: TRY_ATTEMPTS, delay: RETRY_DELAY }
    }
}

/// Attempt bookkeeping for one retried operation.
///
/// The owning adapter calls [`RetryRound::again`] after each transient
/// failure; once the attempt budget is spent it yields
/// [`MqError::Disconnected`], the generic exhaustion error callers can tell
/// apart from a fatal channel error.
#[derive(Debug)]
pub struct RetryRound {
    policy: RetryPolicy,
    failures: usize,
}

impl RetryRound {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Attempt number of the call currently in flight (1-based).
    pub fn attempt(&self) -> usize {
        self.failures + 1
    }

    /// Record a transient failure. `Ok(())` means another attempt may run;
    /// `Err(Disconnected)` means the budget is exhausted.
    pub fn again(&mut self) -> Result<()> {
        self.failures += 1;
        if self.failures >= self.policy.attempts {
            debug!(attempts = self.failures, "connection retries exhausted");
            return Err(MqError::Disconnected);
        }
        debug!(attempt = self.attempt(), "transient broker error, trying again");
        Ok(())
    }
}
