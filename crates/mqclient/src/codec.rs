//! Payload codec: packs a header mapping and an arbitrary data value into an
//! opaque byte blob that any backend transports without interpreting.
//!
//! The envelope is plain JSON so it is stable across process restarts and
//! across backends; a payload produced next to one broker can be decoded next
//! to any other.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
    data: Value,
}

/// Serialize `data` plus an optional `headers` mapping into a payload.
///
/// An empty `headers` map is omitted from the wire form and decodes back to
/// an empty map.
pub fn serialize(data: Value, headers: HashMap<String, String>) -> Result<Bytes> {
    let envelope = Envelope { headers, data };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Decode the `data` field from a payload.
pub fn decode_data(payload: &[u8]) -> Result<Value> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    Ok(envelope.data)
}

/// Decode the `headers` field from a payload.
pub fn decode_headers(payload: &[u8]) -> Result<HashMap<String, String>> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    Ok(envelope.headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_data_and_headers() {
        let headers = HashMap::from([("origin".to_string(), "unit-test".to_string())]);
        let payload = serialize(json!({"price": 100, "ok": true}), headers.clone()).unwrap();

        assert_eq!(decode_data(&payload).unwrap(), json!({"price": 100, "ok": true}));
        assert_eq!(decode_headers(&payload).unwrap(), headers);
    }

    #[test]
    fn test_omitted_headers_decode_to_empty() {
        let payload = serialize(json!("foo, bar"), HashMap::new()).unwrap();
        assert!(decode_headers(&payload).unwrap().is_empty());
        assert_eq!(decode_data(&payload).unwrap(), json!("foo, bar"));
    }

    #[test]
    fn test_garbage_payload_is_a_codec_error() {
        assert!(decode_data(b"\x80not json").is_err());
    }
}
