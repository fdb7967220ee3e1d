//! Per-provider webhook semantics: headers, signatures, normalization.

use axum::http::HeaderMap;
use serde_json::Value;

use crate::signature;

/// Supported webhook providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// GitHub / GitHub Enterprise.
    Github,
    /// GitLab (SaaS or self-managed).
    Gitlab,
    /// Bitbucket Cloud.
    Bitbucket,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl Provider {
    /// Parse a provider from its URL path segment.
    #[must_use]
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "github" => Some(Self::Github),
            "gitlab" => Some(Self::Gitlab),
            "bitbucket" => Some(Self::Bitbucket),
            _ => None,
        }
    }

    /// Canonical provider name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }

    /// Verify the request signature against `secret`.
    ///
    /// GitHub uses `X-Hub-Signature-256` (HMAC-SHA-256) with the legacy
    /// `X-Hub-Signature` (HMAC-SHA-1) accepted only when the deployment
    /// enables it. GitLab compares `X-Gitlab-Token` directly. Bitbucket
    /// signs the body into `X-Hub-Signature`.
    #[must_use]
    pub fn verify(self, headers: &HeaderMap, body: &[u8], secret: &str, allow_legacy: bool) -> bool {
        match self {
            Self::Github => {
                if let Some(sig) = header(headers, "x-hub-signature-256") {
                    return signature::verify_sha256(body, sig, secret);
                }
                if allow_legacy {
                    if let Some(sig) = header(headers, "x-hub-signature") {
                        return signature::verify_sha1(body, sig, secret);
                    }
                }
                false
            }
            Self::Gitlab => header(headers, "x-gitlab-token")
                .is_some_and(|token| signature::verify_token(token, secret)),
            Self::Bitbucket => header(headers, "x-hub-signature")
                .is_some_and(|sig| signature::verify_sha256(body, sig, secret)),
        }
    }

    /// Event name from the provider's event header.
    #[must_use]
    pub fn event_name(self, headers: &HeaderMap) -> Option<String> {
        let value = match self {
            Self::Github => header(headers, "x-github-event")?,
            Self::Gitlab => header(headers, "x-gitlab-event")?,
            Self::Bitbucket => header(headers, "x-event-key")?,
        };
        Some(value.to_string())
    }

    /// Delivery id from the provider's header, when it sends one.
    #[must_use]
    pub fn delivery_id(self, headers: &HeaderMap) -> Option<String> {
        let value = match self {
            Self::Github => header(headers, "x-github-delivery")?,
            Self::Gitlab => header(headers, "x-gitlab-event-uuid")?,
            Self::Bitbucket => header(headers, "x-request-uuid")?,
        };
        Some(value.to_string())
    }

    /// Shape the parsed payload into the canonical normalized form.
    ///
    /// Canonical fields: `action`, `pull_request`, `head_commit`
    /// (falling back to `check_suite.head_commit`), `repository`,
    /// `ref`. Adapters never fail on missing fields; what is absent
    /// stays absent and the rule language sees `null`.
    #[must_use]
    pub fn normalize(self, event_name: &str, mut payload: Value) -> Value {
        match self {
            Self::Github => {
                normalize_github(&mut payload);
                payload
            }
            Self::Gitlab => normalize_gitlab(event_name, payload),
            Self::Bitbucket => normalize_bitbucket(event_name, payload),
        }
    }

    /// Installation id embedded in the payload, when the provider has
    /// an installation concept.
    #[must_use]
    pub fn installation_id(self, normalized: &Value) -> Option<String> {
        match self {
            Self::Github => normalized
                .get("installation")
                .and_then(|i| i.get("id"))
                .map(json_id),
            Self::Gitlab | Self::Bitbucket => None,
        }
    }

    /// Repository full name from the normalized payload.
    #[must_use]
    pub fn repository_full_name(self, normalized: &Value) -> Option<String> {
        normalized
            .get("repository")
            .and_then(|r| r.get("full_name"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }
}

fn json_id(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize_github(payload: &mut Value) {
    // check_suite events carry the head commit one level down; surface
    // it so `head_commit.id` works for both push and check_suite.
    if payload.get("head_commit").is_none() {
        if let Some(head) = payload
            .get("check_suite")
            .and_then(|cs| cs.get("head_commit"))
            .cloned()
        {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("head_commit".to_string(), head);
            }
        }
    }
}

fn normalize_gitlab(_event_name: &str, payload: Value) -> Value {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        other => return payload_or_empty(other),
    };

    // `object_kind` is the real event name; the header is descriptive
    // ("Push Hook") and useless for matching.
    if let Some(kind) = obj.get("object_kind").and_then(Value::as_str).map(ToString::to_string) {
        obj.insert("event".to_string(), Value::String(kind));
    }
    if obj.get("action").is_none() {
        if let Some(action) = obj
            .get("object_attributes")
            .and_then(|a| a.get("action"))
            .cloned()
        {
            obj.insert("action".to_string(), action);
        }
    }
    // Map `project` onto the canonical `repository` shape.
    if obj.get("repository").and_then(|r| r.get("full_name")).is_none() {
        if let Some(project) = obj.get("project") {
            let mut repo = serde_json::Map::new();
            if let Some(full) = project.get("path_with_namespace").cloned() {
                repo.insert("full_name".to_string(), full);
            }
            if let Some(name) = project.get("path").cloned() {
                repo.insert("name".to_string(), name);
            }
            if let Some(id) = project.get("id").cloned() {
                repo.insert("id".to_string(), id);
            }
            obj.insert("repository".to_string(), Value::Object(repo));
        }
    }
    // Merge requests look like pull requests to the rule language.
    if obj.get("pull_request").is_none()
        && obj.get("object_kind").and_then(Value::as_str) == Some("merge_request")
    {
        if let Some(attrs) = obj.get("object_attributes").cloned() {
            obj.insert("pull_request".to_string(), attrs);
        }
    }
    Value::Object(obj)
}

fn normalize_bitbucket(event_name: &str, payload: Value) -> Value {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        other => return payload_or_empty(other),
    };

    // `pullrequest:created` → action `created`.
    if let Some((_, action)) = event_name.split_once(':') {
        obj.entry("action".to_string())
            .or_insert_with(|| Value::String(action.to_string()));
    }
    if obj.get("pull_request").is_none() {
        if let Some(pr) = obj.get("pullrequest").cloned() {
            obj.insert("pull_request".to_string(), pr);
        }
    }
    Value::Object(obj)
}

fn payload_or_empty(payload: Value) -> Value {
    if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*k).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn github_signature_verification() {
        let body = br#"{"action":"opened"}"#;
        let sig = signature::sign_sha256(body, "secret");
        let h = headers(&[("x-hub-signature-256", &sig)]);
        assert!(Provider::Github.verify(&h, body, "secret", false));
        assert!(!Provider::Github.verify(&h, body, "other", false));
        // Missing header fails closed.
        assert!(!Provider::Github.verify(&headers(&[]), body, "secret", false));
    }

    #[test]
    fn github_legacy_signature_needs_opt_in() {
        let body = b"payload";
        let mut mac = <hmac::Hmac<sha1::Sha1> as hmac::Mac>::new_from_slice(b"secret").unwrap();
        hmac::Mac::update(&mut mac, body);
        let sig = format!("sha1={}", hex::encode(hmac::Mac::finalize(mac).into_bytes()));
        let h = headers(&[("x-hub-signature", &sig)]);

        assert!(!Provider::Github.verify(&h, body, "secret", false));
        assert!(Provider::Github.verify(&h, body, "secret", true));
    }

    #[test]
    fn gitlab_token_verification() {
        let h = headers(&[("x-gitlab-token", "tok")]);
        assert!(Provider::Gitlab.verify(&h, b"", "tok", false));
        assert!(!Provider::Gitlab.verify(&h, b"", "other", false));
    }

    #[test]
    fn event_and_delivery_headers() {
        let h = headers(&[
            ("x-github-event", "pull_request"),
            ("x-github-delivery", "d-123"),
        ]);
        assert_eq!(
            Provider::Github.event_name(&h).as_deref(),
            Some("pull_request")
        );
        assert_eq!(Provider::Github.delivery_id(&h).as_deref(), Some("d-123"));
        assert_eq!(Provider::Gitlab.event_name(&h), None);
    }

    #[test]
    fn github_normalize_lifts_check_suite_head_commit() {
        let normalized = Provider::Github.normalize(
            "check_suite",
            json!({"check_suite": {"head_commit": {"id": "abc"}}}),
        );
        assert_eq!(normalized["head_commit"]["id"], "abc");

        // An existing head_commit is left alone.
        let normalized = Provider::Github.normalize(
            "push",
            json!({"head_commit": {"id": "top"}, "check_suite": {"head_commit": {"id": "nested"}}}),
        );
        assert_eq!(normalized["head_commit"]["id"], "top");
    }

    #[test]
    fn gitlab_normalize_maps_project_and_mr() {
        let normalized = Provider::Gitlab.normalize(
            "Merge Request Hook",
            json!({
                "object_kind": "merge_request",
                "object_attributes": {"action": "open", "iid": 7},
                "project": {"id": 3, "path": "r", "path_with_namespace": "o/r"}
            }),
        );
        assert_eq!(normalized["event"], "merge_request");
        assert_eq!(normalized["action"], "open");
        assert_eq!(normalized["repository"]["full_name"], "o/r");
        assert_eq!(normalized["pull_request"]["iid"], 7);
    }

    #[test]
    fn bitbucket_normalize_maps_event_key_suffix() {
        let normalized = Provider::Bitbucket.normalize(
            "pullrequest:created",
            json!({"pullrequest": {"id": 9}, "repository": {"full_name": "o/r"}}),
        );
        assert_eq!(normalized["action"], "created");
        assert_eq!(normalized["pull_request"]["id"], 9);
    }

    #[test]
    fn github_installation_id() {
        let normalized = json!({"installation": {"id": 1234}});
        assert_eq!(
            Provider::Github.installation_id(&normalized).as_deref(),
            Some("1234")
        );
        assert_eq!(Provider::Github.installation_id(&json!({})), None);
    }
}
