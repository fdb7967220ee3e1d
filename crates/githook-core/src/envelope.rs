//! Wire envelope for published events.
//!
//! Messages cross brokers as a small protobuf frame; consumers that find
//! something other than protobuf on the wire fall back to the JSON
//! envelope `{"provider": ..., "name": ..., "data": ...}` so hand-published
//! test messages and older producers keep working.

use bytes::Bytes;
use prost::Message as ProstMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// The stable wire envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventPayload {
    /// Provider name, e.g. `github`.
    #[prost(string, tag = "1")]
    pub provider: ::prost::alloc::string::String,
    /// Event name, e.g. `pull_request`.
    #[prost(string, tag = "2")]
    pub name: ::prost::alloc::string::String,
    /// Original provider JSON body.
    #[prost(bytes = "vec", tag = "3")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// JSON fallback envelope consumed when protobuf decode fails.
#[derive(Debug, Serialize, Deserialize)]
struct JsonEnvelope {
    provider: String,
    name: String,
    #[serde(default)]
    data: Value,
}

impl EventPayload {
    /// Build an envelope from its parts.
    pub fn new(provider: impl Into<String>, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
            payload,
        }
    }

    /// Encode to protobuf bytes.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .unwrap_or_else(|_| unreachable!("Vec<u8> writes are infallible"));
        Bytes::from(buf)
    }

    /// Decode from wire bytes, protobuf first with JSON fallback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the bytes are neither a protobuf
    /// frame nor a JSON envelope with `provider` and `name` fields.
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self> {
        match <Self as ProstMessage>::decode(bytes) {
            // prost will happily decode some JSON as garbage fields; only
            // accept the frame when the required fields materialized.
            Ok(decoded) if !decoded.provider.is_empty() && !decoded.name.is_empty() => Ok(decoded),
            _ => Self::decode_json(bytes),
        }
    }

    fn decode_json(bytes: &[u8]) -> Result<Self> {
        let env: JsonEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::Decode(format!("not protobuf and not a JSON envelope: {e}")))?;
        if env.provider.is_empty() || env.name.is_empty() {
            return Err(Error::Decode(
                "JSON envelope missing provider/name".to_string(),
            ));
        }
        let payload = serde_json::to_vec(&env.data)?;
        Ok(Self {
            provider: env.provider,
            name: env.name,
            payload,
        })
    }

    /// Parse the carried body as JSON; `Value::Null` when it is not JSON.
    #[must_use]
    pub fn normalized(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protobuf_round_trip() {
        let body = br#"{"action":"opened"}"#.to_vec();
        let env = EventPayload::new("github", "pull_request", body.clone());
        let bytes = env.encode_to_bytes();

        let decoded = EventPayload::decode_from_bytes(&bytes).unwrap();
        assert_eq!(decoded.provider, "github");
        assert_eq!(decoded.name, "pull_request");
        assert_eq!(decoded.payload, body);
        assert_eq!(decoded.normalized(), json!({"action": "opened"}));
    }

    #[test]
    fn json_fallback() {
        let wire = serde_json::to_vec(&json!({
            "provider": "gitlab",
            "name": "push",
            "data": {"ref": "refs/heads/main"}
        }))
        .unwrap();

        let decoded = EventPayload::decode_from_bytes(&wire).unwrap();
        assert_eq!(decoded.provider, "gitlab");
        assert_eq!(decoded.name, "push");
        assert_eq!(decoded.normalized(), json!({"ref": "refs/heads/main"}));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = EventPayload::decode_from_bytes(b"\x00\xffnot a frame").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn json_without_provider_is_rejected() {
        let err = EventPayload::decode_from_bytes(br#"{"name":"push","data":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
