//! Factory surface: one stateless [`BrokerClient`] per backend, resolved
//! through the closed [`Broker`] registry at startup.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MqError, Result};
use crate::memory::MemoryBrokerClient;
use crate::nats::NatsBrokerClient;
use crate::queue::{Pub, Sub};
use crate::rabbitmq::RabbitBrokerClient;

/// The supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Broker {
    Memory,
    Nats,
    Rabbitmq,
}

impl Broker {
    /// Resolve the factory for this backend.
    pub fn client(self) -> Box<dyn BrokerClient> {
        match self {
            Broker::Memory => Box::new(MemoryBrokerClient),
            Broker::Nats => Box::new(NatsBrokerClient),
            Broker::Rabbitmq => Box::new(RabbitBrokerClient),
        }
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Broker::Memory => write!(f, "memory"),
            Broker::Nats => write!(f, "nats"),
            Broker::Rabbitmq => write!(f, "rabbitmq"),
        }
    }
}

impl FromStr for Broker {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(Broker::Memory),
            "nats" => Ok(Broker::Nats),
            "rabbitmq" => Ok(Broker::Rabbitmq),
            other => Err(MqError::UnknownBroker(other.to_string())),
        }
    }
}

/// Stateless pub/sub factory for one backend.
///
/// Both constructors return an already-connected queue; the queue's identity
/// (address and name binding) is fixed at creation.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create and connect a publishing queue.
    async fn create_pub_queue(
        &self,
        address: &str,
        name: &str,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn Pub>>;

    /// Create and connect a subscription queue. `prefetch` bounds the
    /// subscriber's unacknowledged in-flight window.
    async fn create_sub_queue(
        &self,
        address: &str,
        name: &str,
        prefetch: usize,
        auth_token: Option<&str>,
    ) -> Result<Box<dyn Sub>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_names_roundtrip() {
        for broker in [Broker::Memory, Broker::Nats, Broker::Rabbitmq] {
            assert_eq!(broker.to_string().parse::<Broker>().unwrap(), broker);
            assert_eq!(broker.client().name(), broker.to_string());
        }
    }

    #[test]
    fn test_unknown_broker_name_is_rejected() {
        assert!(matches!("kafka".parse::<Broker>(), Err(MqError::UnknownBroker(_))));
    }
}
