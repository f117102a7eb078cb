//! Cancellable, cooperative message production over a [`Sub`].
//!
//! Instead of injecting consumer failures back into a suspended producer, the
//! protocol is an explicit two-channel exchange: [`MessageStream::next`]
//! yields a discriminated [`StreamItem`], and after handling a message the
//! consumer reports a discriminated [`Outcome`] via [`MessageStream::resolve`].
//! The stream interprets a failed outcome per
//! [`StreamOptions::propagate_errors`].

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{BoxError, MqError, Result};
use crate::message::Message;
use crate::queue::Sub;

/// If no message arrives within this window the stream ends cleanly and the
/// caller is expected to come back with a fresh stream to resume listening.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// No-message window after which the stream ends without error.
    pub inactivity_timeout: Duration,
    /// Whether a failed [`Outcome`] kills the stream (`true`, default) or is
    /// reported back as [`StreamItem::Skipped`] so the loop can continue.
    /// Broker-side errors always propagate regardless.
    pub propagate_errors: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT, propagate_errors: true }
    }
}

/// One step of the stream.
#[derive(Debug)]
pub enum StreamItem {
    /// The next message, in broker order. Exactly one message is in flight
    /// to the caller at a time.
    Delivered(Message),
    /// A downstream failure was suppressed (`propagate_errors = false`).
    /// The failure was reported, the loop continues.
    Skipped,
}

/// The consumer's verdict on the message it was handed.
pub enum Outcome {
    Continue,
    Failed(BoxError),
}

enum Phase {
    /// Ready to pull the next message.
    Receiving,
    /// A message is in the caller's hands; no outcome reported yet.
    InFlight,
    /// The caller reported a failure that has not been surfaced yet.
    FailedPending(BoxError),
    /// Inactivity timeout or propagated failure; the stream is spent.
    Ended,
}

/// Single-threaded cooperative producer over a subscriber.
///
/// Dropping the stream early performs no broker interaction; requesting
/// redelivery of unsettled messages is `close()`'s job.
pub struct MessageStream<'a, S: ?Sized> {
    sub: &'a mut S,
    opts: StreamOptions,
    phase: Phase,
}

impl<'a, S: Sub + ?Sized> MessageStream<'a, S> {
    pub fn new(sub: &'a mut S, opts: StreamOptions) -> Self {
        debug!(
            inactivity_timeout = ?opts.inactivity_timeout,
            propagate_errors = opts.propagate_errors,
            "message stream opened"
        );
        Self { sub, opts, phase: Phase::Receiving }
    }

    /// Pull the next item. `Ok(None)` is the clean end of the stream (no
    /// message within the inactivity window); a fresh stream resumes
    /// listening.
    pub async fn next(&mut self) -> Result<Option<StreamItem>> {
        match std::mem::replace(&mut self.phase, Phase::Receiving) {
            Phase::Ended => {
                self.phase = Phase::Ended;
                return Ok(None);
            }
            Phase::FailedPending(err) => {
                if self.opts.propagate_errors {
                    debug!("propagating downstream error");
                    self.phase = Phase::Ended;
                    return Err(MqError::Downstream(err));
                }
                warn!(error = %err, "suppressed downstream error, continuing");
                return Ok(Some(StreamItem::Skipped));
            }
            // An unreported outcome counts as `Continue`.
            Phase::InFlight | Phase::Receiving => {}
        }

        match self.sub.receive(Some(self.opts.inactivity_timeout)).await {
            Ok(Some(msg)) => {
                debug!(msg_id = %msg.msg_id(), "yielding message");
                self.phase = Phase::InFlight;
                Ok(Some(StreamItem::Delivered(msg)))
            }
            Ok(None) => {
                info!("no message within inactivity timeout, stream ending");
                self.phase = Phase::Ended;
                Ok(None)
            }
            Err(e) => {
                self.phase = Phase::Ended;
                Err(e)
            }
        }
    }

    /// Report the outcome of handling the last yielded message. Without a
    /// report, the next [`MessageStream::next`] call assumes
    /// [`Outcome::Continue`].
    pub fn resolve(&mut self, outcome: Outcome) {
        if let Outcome::Failed(err) = outcome {
            debug!(error = %err, "downstream consumer reported a failure");
            self.phase = Phase::FailedPending(err);
        } else if matches!(self.phase, Phase::InFlight) {
            self.phase = Phase::Receiving;
        }
    }

    /// Settle a message without giving up the stream's borrow of the
    /// subscriber.
    pub async fn ack(&mut self, msg: &mut Message) -> Result<()> {
        self.sub.ack(msg).await
    }

    /// Reject a message without giving up the stream's borrow of the
    /// subscriber.
    pub async fn reject(&mut self, msg: &mut Message) -> Result<()> {
        self.sub.reject(msg).await
    }
}
