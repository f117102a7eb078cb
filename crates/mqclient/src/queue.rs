//! The queue contract every backend adapter satisfies: the
//! `Unconnected -> Connected -> Closed` lifecycle, plus the `Pub`/`Sub`
//! capability surfaces.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{MqError, Result};
use crate::message::Message;

/// Default `receive` timeout.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 1000;
/// Delay between a reconnect-triggering failure and the next attempt.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);
/// Total attempts for a retried operation: 1 initial try plus 2 retries.
pub const TRY_ATTEMPTS: usize = 3;
/// Default bound on unacknowledged in-flight messages per subscriber.
pub const DEFAULT_PREFETCH: usize = 1;
/// Grace period before a subscriber close, letting in-flight settlement calls
/// land before unacked messages are handed back for redelivery.
pub const CLOSE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueState {
    #[default]
    Unconnected,
    Connected,
    Closed,
}

/// Connection lifecycle shared by every adapter.
///
/// Adapters embed one of these and call the transition helpers instead of
/// re-implementing state checks. `Closed` is terminal for callers; only the
/// retry machinery may re-open a queue via [`Lifecycle::reset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Lifecycle {
    state: QueueState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Validate that `connect()` may run.
    pub fn check_connect(&self) -> Result<()> {
        match self.state {
            QueueState::Unconnected => Ok(()),
            QueueState::Connected => {
                Err(MqError::ConnectingFailed("queue is already connected".into()))
            }
            QueueState::Closed => Err(MqError::ConnectingFailed("queue is closed".into())),
        }
    }

    pub fn mark_connected(&mut self) {
        self.state = QueueState::Connected;
    }

    /// Validate that `close()` may run. Closing twice is a distinct error
    /// from closing something that was never connected.
    pub fn check_close(&self) -> Result<()> {
        match self.state {
            QueueState::Connected => Ok(()),
            QueueState::Closed => Err(MqError::AlreadyClosed),
            QueueState::Unconnected => {
                Err(MqError::ClosingFailed("no connection to close".into()))
            }
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = QueueState::Closed;
    }

    /// Data operations are only valid while connected.
    pub fn require_connected(&self) -> Result<()> {
        match self.state {
            QueueState::Connected => Ok(()),
            _ => Err(MqError::NotConnected),
        }
    }

    /// Re-open a closed queue so the retry policy can reconnect. Not part of
    /// the public lifecycle.
    pub(crate) fn reset(&mut self) {
        self.state = QueueState::Unconnected;
    }
}

/// Base queue surface: connection lifecycle only.
#[async_trait]
pub trait RawQueue: Send {
    fn state(&self) -> QueueState;

    /// Establish the broker connection and any broker-side resources needed
    /// to send or receive. Valid only from `Unconnected`.
    async fn connect(&mut self) -> Result<()>;

    /// Release the connection. Valid only from `Connected`; not idempotent.
    ///
    /// Subscribers first hand back everything received-but-unacked on this
    /// connection so nothing is lost on shutdown.
    async fn close(&mut self) -> Result<()>;
}

/// Publisher queue.
#[async_trait]
pub trait Pub: RawQueue {
    /// Send one opaque payload.
    async fn send(&mut self, payload: Bytes) -> Result<()>;
}

/// Subscriber queue.
#[async_trait]
pub trait Sub: RawQueue {
    /// Get a single message. `Ok(None)` means no message arrived within
    /// `timeout`; `timeout: None` blocks until one does.
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<Message>>;

    /// Acknowledge a previously received message. Whether settling one
    /// message also settles earlier outstanding ones is backend-defined;
    /// see the adapter docs.
    async fn ack(&mut self, msg: &mut Message) -> Result<()>;

    /// Reject (nack) a previously received message, requesting redelivery.
    async fn reject(&mut self, msg: &mut Message) -> Result<()>;
}
