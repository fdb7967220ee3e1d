//! The webhook ingest pipeline.
//!
//! One linear pass per request: size limit, signature, instance
//! resolution, header parse, replay dedup, installation lookup,
//! normalization, rule matching, event-log rows, publish, terminal
//! transition. Publish failures are recovered into the event log; the
//! provider still gets a 2xx so it does not retry a payload we already
//! recorded.

use axum::http::{HeaderMap, StatusCode};
use githook_core::{meta, EventPayload, EventStatus, TenantCtx};
use githook_rules::RuleMatch;
use githook_store::{body_sha256, EventLogRecord, ProviderInstanceRecord};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::providers::Provider;
use crate::state::AppState;

/// Outcome returned to the HTTP layer.
pub struct IngestOutcome {
    /// Response status.
    pub status: StatusCode,
    /// Response body.
    pub body: Value,
}

impl IngestOutcome {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn status(status: StatusCode, reason: &str) -> Self {
        Self {
            status,
            body: json!({"status": "rejected", "reason": reason}),
        }
    }
}

/// Run the full pipeline for one webhook request.
pub async fn ingest(
    state: &AppState,
    provider: Provider,
    instance_key: Option<&str>,
    tenant: TenantCtx,
    headers: &HeaderMap,
    body: &[u8],
) -> IngestOutcome {
    // 1. Size limit (the body limit layer rejects earlier; this guards
    //    direct callers of the pipeline).
    if body.len() > state.config.max_body_bytes {
        return IngestOutcome::status(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large");
    }

    // Content type must be JSON when provided.
    if let Some(content_type) = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if !content_type.starts_with("application/json") {
            return IngestOutcome::status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "not_json");
        }
    }

    // 2+3. Resolve the provider instance by trying each candidate's
    //      secret until one verifies the signature.
    let Some(instance) = resolve_instance(state, provider, instance_key, &tenant, headers, body)
        .await
    else {
        warn!(provider = provider.name(), "webhook signature verification failed");
        return IngestOutcome::status(StatusCode::UNAUTHORIZED, "signature");
    };
    let tenant = instance.tenant.clone();

    // 4. Headers.
    let event_name = provider
        .event_name(headers)
        .unwrap_or_else(|| "unknown".to_string());
    let delivery_id = provider
        .delivery_id(headers)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);

    if state.dedup.check_and_insert(provider.name(), &delivery_id) {
        debug!(
            provider = provider.name(),
            delivery_id = %delivery_id,
            "duplicate delivery suppressed"
        );
        return IngestOutcome::ok(json!({"status": "accepted", "duplicate": true}));
    }

    info!(
        provider = provider.name(),
        event = %event_name,
        delivery_id = %delivery_id,
        request_id = %request_id,
        tenant = %tenant,
        "received webhook"
    );

    // 6. Normalize. A body that is not JSON at all is a 415.
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(provider = provider.name(), error = %e, "webhook body is not JSON");
            return IngestOutcome::status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "body_not_json");
        }
    };
    let normalized = provider.normalize(&event_name, parsed);

    // 5. Installation lookup; missing installations are not an error.
    let installation_id = match provider.installation_id(&normalized) {
        Some(id) => match state
            .installations
            .get_by_installation_id(&tenant, provider.name(), &id)
            .await
        {
            Ok(record) => record.installation_id,
            Err(_) => {
                debug!(installation_id = %id, "installation not registered");
                id
            }
        },
        None => String::new(),
    };
    let namespace = provider.repository_full_name(&normalized).unwrap_or_default();

    // 7. Rule evaluation.
    let matches = match state.engine.try_evaluate(&normalized) {
        Ok(matches) => matches,
        Err(e) => {
            error!(error = %e, "rule evaluation failed");
            return IngestOutcome::status(StatusCode::INTERNAL_SERVER_ERROR, "rule_eval");
        }
    };

    let headers_map = header_map(headers);
    let body_string = String::from_utf8_lossy(body).into_owned();
    let body_hash = body_sha256(body);

    let base_row = |topic: &str, rule: Option<&RuleMatch>| {
        let mut row = EventLogRecord::queued(
            tenant.clone(),
            provider.name(),
            &event_name,
            &request_id,
        );
        row.installation_id = installation_id.clone();
        row.namespace = namespace.clone();
        row.topic = topic.to_string();
        row.headers = headers_map.clone();
        row.body = body_string.clone();
        row.body_hash = body_hash.clone();
        row.matched = rule.is_some();
        if let Some(rule) = rule {
            row.rule_id = rule.rule_id.clone();
            row.rule_when = rule.when.clone();
        }
        row
    };

    // 8. No match: one audit row, nothing to publish.
    if matches.is_empty() {
        let row = base_row("", None);
        let log_id = row.id.clone();
        if let Err(e) = state.event_logs.create(row).await {
            error!(error = %e, "failed to record event log");
            return IngestOutcome::status(StatusCode::INTERNAL_SERVER_ERROR, "event_log");
        }
        return IngestOutcome::ok(json!({
            "status": "accepted",
            "matched": false,
            "log_ids": [log_id],
        }));
    }

    // 8+9+10. One row per (rule, topic): create queued, publish,
    // transition to delivered or failed.
    let envelope =
        EventPayload::new(provider.name(), event_name.clone(), body.to_vec()).encode_to_bytes();
    let mut log_ids = Vec::new();
    let mut any_failed = false;

    for rule in &matches {
        let driver_name = state
            .publishers
            .driver_name(&tenant, &rule.driver_id)
            .await
            .unwrap_or_default();

        for topic in &rule.topics {
            let mut row = base_row(topic, Some(rule));
            row.drivers = vec![driver_name.clone()];
            let log_id = row.id.clone();
            if let Err(e) = state.event_logs.create(row).await {
                error!(error = %e, "failed to record event log");
                return IngestOutcome::status(StatusCode::INTERNAL_SERVER_ERROR, "event_log");
            }

            let mut metadata = HashMap::new();
            metadata.insert(meta::LOG_ID.to_string(), log_id.clone());
            metadata.insert(meta::PROVIDER.to_string(), provider.name().to_string());
            metadata.insert(meta::EVENT.to_string(), event_name.clone());
            metadata.insert(meta::TOPIC.to_string(), topic.clone());
            metadata.insert(meta::DRIVER.to_string(), driver_name.clone());
            metadata.insert(
                meta::INSTALLATION_ID.to_string(),
                installation_id.clone(),
            );
            metadata.insert(
                meta::PROVIDER_INSTANCE_KEY.to_string(),
                instance.key.clone(),
            );
            metadata.insert(meta::REQUEST_ID.to_string(), request_id.clone());
            metadata.insert(meta::TENANT_ID.to_string(), tenant.id().to_string());

            let publish_result = state
                .publishers
                .publish(&tenant, &rule.driver_id, topic, &envelope, &metadata)
                .await;

            let (status, error_message) = match publish_result {
                Ok(()) => (EventStatus::Delivered, None),
                Err(e) => {
                    warn!(
                        topic = %topic,
                        driver_id = %rule.driver_id,
                        error = %e,
                        "publish failed"
                    );
                    any_failed = true;
                    (EventStatus::Failed, Some(e.to_string()))
                }
            };
            if let Err(e) = state
                .event_logs
                .transition(&tenant, &log_id, status, error_message)
                .await
            {
                error!(log_id = %log_id, error = %e, "event-log transition failed");
            }
            log_ids.push(log_id);
        }
    }

    IngestOutcome::ok(json!({
        "status": "accepted",
        "matched": true,
        "delivered": !any_failed,
        "log_ids": log_ids,
    }))
}

/// Try each enabled instance until one's secret verifies the request.
async fn resolve_instance(
    state: &AppState,
    provider: Provider,
    instance_key: Option<&str>,
    tenant: &TenantCtx,
    headers: &HeaderMap,
    body: &[u8],
) -> Option<ProviderInstanceRecord> {
    let allow_legacy = state.config.allow_legacy_signature;
    let candidates = match instance_key {
        Some(key) => state
            .instances
            .get(tenant, provider.name(), key)
            .await
            .ok()
            .filter(|i| i.enabled)
            .into_iter()
            .collect::<Vec<_>>(),
        None => state
            .instances
            .list_enabled(tenant, provider.name())
            .await
            .unwrap_or_default(),
    };
    if candidates.is_empty() {
        return None;
    }

    // Instances with a secret are tried first; a secretless instance
    // only wins when nothing else verified (dev deployments).
    let (with_secret, without_secret): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|i| i.webhook_secret().is_some());

    for instance in with_secret {
        let secret = instance.webhook_secret().unwrap_or_default();
        if provider.verify(headers, body, secret, allow_legacy) {
            return Some(instance);
        }
    }
    without_secret.into_iter().next()
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            // Secrets never land in the event log.
            let name = name.as_str().to_lowercase();
            if name == "x-gitlab-token" || name == "authorization" || name == "cookie" {
                return None;
            }
            value
                .to_str()
                .ok()
                .map(|v| (name, v.to_string()))
        })
        .collect()
}
