//! mqclient: broker-agnostic message-queue pub/sub client
//!
//! One `Message`/`Pub`/`Sub`/`BrokerClient` contract satisfied identically by
//! every backend adapter, hiding divergent native delivery models (per-message
//! vs. cumulative acknowledgment, blocking vs. polling receive) without
//! changing the at-least-once delivery guarantee. Backends: NATS JetStream,
//! RabbitMQ, and an in-process broker for testing.

pub mod client;
pub mod codec;
pub mod error;
pub mod memory;
pub mod message;
pub mod nats;
pub mod queue;
pub mod rabbitmq;
pub mod retry;
pub mod stream;

pub use client::{Broker, BrokerClient};
pub use error::{BoxError, MqError, Result};
pub use message::{AckStatus, Message, MessageId};
pub use queue::{
    Lifecycle, Pub, QueueState, RawQueue, Sub, DEFAULT_PREFETCH, DEFAULT_TIMEOUT_MILLIS,
    RETRY_DELAY, TRY_ATTEMPTS,
};
pub use retry::{ErrorClass, RetryPolicy, RetryRound};
pub use stream::{MessageStream, Outcome, StreamItem, StreamOptions};
