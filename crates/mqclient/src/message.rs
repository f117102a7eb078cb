use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::codec;
use crate::error::Result;

/// Broker-assigned message identifier.
///
/// Only meaningful to the adapter that issued it, and not stable across
/// redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Sequence(u64),
    Text(String),
    Blob(Vec<u8>),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Sequence(n) => write!(f, "{n}"),
            MessageId::Text(s) => write!(f, "{s}"),
            MessageId::Blob(b) => write!(f, "blob({} bytes)", b.len()),
        }
    }
}

/// Settlement state of a message, as last reported by the owning subscriber.
///
/// Informational only: the contract does not forbid re-settling a message,
/// the broker gets the last word either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckStatus {
    #[default]
    None,
    Acked,
    Nacked,
}

/// A received message: broker identity plus the raw payload, with the two
/// logical fields (`data`, `headers`) decoded lazily and cached on first
/// access.
///
/// Constructed only by backend adapters when converting a broker-native
/// delivery.
#[derive(Clone)]
pub struct Message {
    msg_id: MessageId,
    payload: Bytes,
    ack_status: AckStatus,
    data: OnceCell<Value>,
    headers: OnceCell<HashMap<String, String>>,
}

impl Message {
    pub(crate) fn new(msg_id: MessageId, payload: Bytes) -> Self {
        Self {
            msg_id,
            payload,
            ack_status: AckStatus::None,
            data: OnceCell::new(),
            headers: OnceCell::new(),
        }
    }

    pub fn msg_id(&self) -> &MessageId {
        &self.msg_id
    }

    /// The exact bytes transmitted by the broker.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn ack_status(&self) -> AckStatus {
        self.ack_status
    }

    pub(crate) fn set_ack_status(&mut self, status: AckStatus) {
        self.ack_status = status;
    }

    /// The decoded `data` field. Decoded at most once per instance.
    pub fn data(&self) -> Result<&Value> {
        self.data.get_or_try_init(|| codec::decode_data(&self.payload))
    }

    /// The decoded `headers` field. Decoded at most once per instance.
    pub fn headers(&self) -> Result<&HashMap<String, String>> {
        self.headers.get_or_try_init(|| codec::decode_headers(&self.payload))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("msg_id", &self.msg_id)
            .field("payload", &self.payload)
            .field("ack_status", &self.ack_status)
            .finish()
    }
}

/// Two messages are equal iff their decoded `data` fields are equal.
///
/// `msg_id` differs across redelivery and `headers` carry internal metadata,
/// so neither takes part in equality.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        match (self.data(), other.data()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
