use thiserror::Error;

/// Error type handed back into a message stream by downstream consumer code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum MqError {
    /// A `connect()` invocation failed while configuring the underlying client.
    #[error("connecting failed: {0}")]
    ConnectingFailed(String),

    /// A `close()` invocation failed (including "nothing to close").
    #[error("closing failed: {0}")]
    ClosingFailed(String),

    /// `close()` was invoked on an already-closed queue. Distinct from
    /// [`MqError::ClosingFailed`]: double close is a caller bug, not a broker
    /// failure.
    #[error("queue is already closed")]
    AlreadyClosed,

    /// A data operation was invoked outside the `Connected` state. Never
    /// retried.
    #[error("queue is not connected")]
    NotConnected,

    /// Acking a message was rejected by the broker.
    #[error("ack failed: {0}")]
    Ack(String),

    /// Nacking a message was rejected by the broker.
    #[error("nack failed: {0}")]
    Nack(String),

    /// A channel/protocol-level broker error. Structurally fatal, never
    /// retried.
    #[error("broker channel error: {0}")]
    Channel(String),

    /// Connection retries were exhausted without the operation succeeding.
    #[error("broker connection error: retries exhausted")]
    Disconnected,

    /// The payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A consumer of the message stream reported a failure and the stream is
    /// configured to propagate it.
    #[error("downstream consumer error: {0}")]
    Downstream(#[source] BoxError),

    /// No backend is registered under the given name.
    #[error("unknown broker: {0}")]
    UnknownBroker(String),
}

pub type Result<T> = std::result::Result<T, MqError>;
