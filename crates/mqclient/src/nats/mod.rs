//! NATS JetStream backend.
//!
//! Per-message settlement with a blocking receive: each delivery is acked or
//! naked individually (`AckPolicy::Explicit`), and `receive` blocks until a
//! message arrives or the timeout expires. All subscribers to a queue share
//! one durable consumer, so they drain the queue cooperatively instead of
//! each getting every message.

mod queue;

pub use queue::{NatsBrokerClient, NatsPub, NatsSub};

/// Durable consumer shared by every subscriber of a queue. Unique names
/// would create independent subscriptions that each see every message.
pub(crate) const SUBSCRIPTION_NAME: &str = "mqclient-sub";

/// Broker-side redelivery timer for unacked messages, in seconds. Ignored
/// unless greater than 10 so it cannot race the client's own retry delay.
pub(crate) const ACK_WAIT_ENV: &str = "MQCLIENT_ACK_WAIT_SECS";

pub(crate) fn normalize_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("nats://{address}")
    }
}

/// JetStream stream names allow a narrower charset than queue names.
pub(crate) fn stream_name(queue: &str) -> String {
    let token: String = queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("MQ_{token}")
}
