//! In-flight event and broker message types.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;

/// A raw message as it arrives from (or goes to) a broker transport.
#[derive(Debug, Clone)]
pub struct Message {
    /// Serialized envelope bytes.
    pub payload: Bytes,
    /// Transport metadata (see [`crate::meta`] for the key set).
    pub metadata: HashMap<String, String>,
    /// Topic the message was received on.
    pub topic: String,
}

impl Message {
    /// Build a message for `topic` carrying `payload`.
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            payload,
            metadata: HashMap::new(),
            topic: topic.into(),
        }
    }

    /// Metadata value for `key`, if present.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A decoded event as seen by worker handlers.
///
/// `normalized` is the parsed provider JSON; `payload` the original raw
/// body. The provider client slot is filled by the worker runtime when a
/// client provider is configured.
#[derive(Debug, Clone, Default)]
pub struct Event {
    /// Source provider (`github`, `gitlab`, `bitbucket`, ...).
    pub provider: String,
    /// Event kind, e.g. `pull_request` or `push`.
    pub kind: String,
    /// Emit topic this event was delivered on.
    pub topic: String,
    /// Broker metadata as received.
    pub metadata: HashMap<String, String>,
    /// Original provider JSON body.
    pub payload: Bytes,
    /// Parsed body; `Value::Null` when the body was not JSON.
    pub normalized: Value,
}

impl Event {
    /// Event-log row id carried in metadata, if any.
    #[must_use]
    pub fn log_id(&self) -> Option<&str> {
        self.metadata.get(crate::meta::LOG_ID).map(String::as_str)
    }

    /// Installation id carried in metadata; empty when unresolved.
    #[must_use]
    pub fn installation_id(&self) -> &str {
        self.metadata
            .get(crate::meta::INSTALLATION_ID)
            .map_or("", String::as_str)
    }

    /// Tenant id carried in metadata; empty for the global scope.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        self.metadata
            .get(crate::meta::TENANT_ID)
            .map_or("", String::as_str)
    }

    /// Look up a dotted path in the normalized payload.
    ///
    /// Returns `None` when any segment is missing, mirroring the rule
    /// language's null-safe field access.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.normalized;
        for seg in path.split('.') {
            cur = cur.get(seg)?;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_walks_nested_paths() {
        let evt = Event {
            normalized: json!({"pull_request": {"number": 7, "draft": false}}),
            ..Event::default()
        };
        assert_eq!(evt.field("pull_request.number"), Some(&json!(7)));
        assert_eq!(evt.field("pull_request.missing"), None);
        assert_eq!(evt.field("nope"), None);
    }

    #[test]
    fn metadata_accessors_default_to_empty() {
        let evt = Event::default();
        assert_eq!(evt.log_id(), None);
        assert_eq!(evt.installation_id(), "");
        assert_eq!(evt.tenant_id(), "");
    }
}
