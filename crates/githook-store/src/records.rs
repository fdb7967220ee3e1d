//! Record types persisted by the stores.

use chrono::{DateTime, Utc};
use githook_core::{EventStatus, TenantCtx};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Instance key used when a tenant has exactly one config per provider.
pub const DEFAULT_INSTANCE_KEY: &str = "default";

/// Canonical fingerprint of a provider-instance config.
///
/// The canonical form is the JSON re-serialized with sorted object keys
/// (serde_json's default map ordering); the fingerprint is the 64-char
/// hex SHA-256 of that string. Two enabled instances of one
/// `(tenant, provider)` must never share a fingerprint.
#[must_use]
pub fn config_fingerprint(config: &Value) -> String {
    let canonical = serde_json::to_string(config).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// A tenant's configuration for one provider kind (e.g. a GitHub App).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstanceRecord {
    /// Owning tenant.
    pub tenant: TenantCtx,
    /// Provider name (`github`, `gitlab`, `bitbucket`, ...).
    pub provider: String,
    /// `"default"` or the config fingerprint.
    pub key: String,
    /// Provider-specific config (app id, secrets, base URLs, ...).
    pub config: Value,
    /// Base URL OAuth redirects are built against.
    #[serde(default)]
    pub redirect_base_url: String,
    /// Disabled instances are skipped during webhook resolution.
    pub enabled: bool,
}

impl ProviderInstanceRecord {
    /// The webhook secret configured on this instance, if any.
    #[must_use]
    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.get("webhook_secret").and_then(Value::as_str)
    }
}

/// One authenticated account under a provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationRecord {
    /// Owning tenant.
    pub tenant: TenantCtx,
    /// Provider name.
    pub provider: String,
    /// Provider-instance key this installation belongs to.
    pub instance_key: String,
    /// Provider-side account id (user or org).
    pub account_id: String,
    /// Human-readable account name.
    pub account_name: String,
    /// Provider-side installation id; unique per provider.
    pub installation_id: String,
    /// Stored access token, when the provider uses static tokens.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Refresh token for providers with expiring tokens (Bitbucket).
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access-token expiry, when known.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-specific extras.
    #[serde(default)]
    pub metadata: Value,
}

/// A repository attached to an installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Owning tenant.
    pub tenant: TenantCtx,
    /// Provider name.
    pub provider: String,
    /// Provider-instance key.
    pub instance_key: String,
    /// Provider-side repository id.
    pub repo_id: String,
    /// Repository owner (user or org).
    pub owner: String,
    /// Repository short name.
    pub name: String,
    /// `owner/name`.
    pub full_name: String,
    /// `public` / `private` / `internal`.
    pub visibility: String,
    /// Default branch name.
    pub default_branch: String,
    /// Web URL.
    #[serde(default)]
    pub html_url: String,
    /// Clone URL.
    #[serde(default)]
    pub clone_url: String,
    /// Whether webhooks are configured on this repository.
    pub webhooks_enabled: bool,
}

/// A routing rule: `when` expression, emit topics, target driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Owning tenant.
    pub tenant: TenantCtx,
    /// Rule id, unique per tenant.
    pub id: String,
    /// Boolean expression over the normalized event.
    pub when: String,
    /// Ordered emit topics; deduplicated on read.
    pub emit: Vec<String>,
    /// Driver this rule publishes through.
    pub driver_id: String,
    /// Optional payload transform, applied by downstream consumers.
    #[serde(default)]
    pub transform_js: Option<String>,
}

impl RuleRecord {
    /// Emit topics with duplicates removed, first occurrence winning.
    #[must_use]
    pub fn emit_topics(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.emit
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect()
    }
}

/// One configured broker transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    /// Owning tenant.
    pub tenant: TenantCtx,
    /// Driver id, unique per tenant.
    pub id: String,
    /// Transport name: `amqp`, `nats`, `kafka`, `sql`, `riverqueue`,
    /// `channel`, or `http`.
    pub name: String,
    /// Transport-specific options.
    pub config: Value,
    /// Disabled drivers refuse resolution.
    pub enabled: bool,
}

/// Persistent audit row for one webhook receipt, one per (rule, topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogRecord {
    /// Owning tenant.
    pub tenant: TenantCtx,
    /// Row id, assigned before publish.
    pub id: String,
    /// Source provider.
    pub provider: String,
    /// Event name, e.g. `pull_request`.
    pub name: String,
    /// Ingress request id.
    pub request_id: String,
    /// Installation id; empty when unresolved.
    pub installation_id: String,
    /// Repository full name; empty when the payload carried none.
    pub namespace: String,
    /// Emit topic for this row; empty on unmatched audit rows.
    pub topic: String,
    /// Matched rule id; empty on unmatched audit rows.
    pub rule_id: String,
    /// The matched rule's `when` expression, for audit.
    pub rule_when: String,
    /// Driver names the topic was published through.
    pub drivers: Vec<String>,
    /// Original request body.
    pub body: String,
    /// Transformed body, when a rule transform applied.
    #[serde(default)]
    pub transformed_body: Option<String>,
    /// Request headers as received.
    pub headers: HashMap<String, String>,
    /// Hex SHA-256 of the raw body.
    pub body_hash: String,
    /// Whether any rule matched this event.
    pub matched: bool,
    /// Delivery state.
    pub status: EventStatus,
    /// First error message on the failure path.
    #[serde(default)]
    pub error_message: String,
    /// Milliseconds from creation to the terminal transition.
    #[serde(default)]
    pub latency_ms: i64,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl EventLogRecord {
    /// Create a fresh `queued` row. The id is assigned here, before any
    /// publish, so broker metadata can reference it.
    #[must_use]
    pub fn queued(tenant: TenantCtx, provider: &str, name: &str, request_id: &str) -> Self {
        let now = Utc::now();
        Self {
            tenant,
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            name: name.to_string(),
            request_id: request_id.to_string(),
            installation_id: String::new(),
            namespace: String::new(),
            topic: String::new(),
            rule_id: String::new(),
            rule_when: String::new(),
            drivers: Vec::new(),
            body: String::new(),
            transformed_body: None,
            headers: HashMap::new(),
            body_hash: String::new(),
            matched: false,
            status: EventStatus::Queued,
            error_message: String::new(),
            latency_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Hex SHA-256 of a raw request body.
#[must_use]
pub fn body_sha256(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = json!({"app_id": 1, "webhook_secret": "s"});
        let b = json!({"webhook_secret": "s", "app_id": 1});
        assert_eq!(config_fingerprint(&a), config_fingerprint(&b));
        assert_eq!(config_fingerprint(&a).len(), 64);
    }

    #[test]
    fn fingerprint_differs_on_content() {
        let a = json!({"app_id": 1});
        let b = json!({"app_id": 2});
        assert_ne!(config_fingerprint(&a), config_fingerprint(&b));
    }

    #[test]
    fn emit_topics_dedup_preserves_order() {
        let rule = RuleRecord {
            tenant: TenantCtx::global(),
            id: "r1".into(),
            when: "true".into(),
            emit: vec!["a".into(), "b".into(), "a".into(), "c".into()],
            driver_id: "d1".into(),
            transform_js: None,
        };
        assert_eq!(rule.emit_topics(), vec!["a", "b", "c"]);
    }

    #[test]
    fn queued_rows_start_queued_with_fresh_id() {
        let row = EventLogRecord::queued(TenantCtx::global(), "github", "push", "req-1");
        assert_eq!(row.status, EventStatus::Queued);
        assert!(!row.id.is_empty());
        assert_eq!(row.created_at, row.updated_at);
    }
}
