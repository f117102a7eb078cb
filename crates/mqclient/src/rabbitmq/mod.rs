//! RabbitMQ (AMQP 0.9.1) backend.
//!
//! Cumulative settlement with a polling receive: acks and nacks carry
//! `multiple = true`, so settling the Nth outstanding message on a channel
//! also settles every earlier one, and `receive` polls `basic_get` until the
//! deadline. Callers relying on independent partial acknowledgment must
//! account for this per-backend divergence.

mod queue;

pub use queue::{RabbitBrokerClient, RabbitPub, RabbitSub};

pub(crate) fn normalize_address(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("amqp://{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_address_gets_amqp_scheme() {
        assert_eq!(normalize_address("localhost:5672"), "amqp://localhost:5672");
        assert_eq!(normalize_address("amqps://broker"), "amqps://broker");
    }
}
