//! Control-plane API consumed by the worker SDK.
//!
//! Everything lives under `/api/v1`. Requests authenticate with
//! `x-api-key` or an OIDC bearer token (verification of the latter is
//! delegated to the deployment's verifier in front of this service);
//! `X-Tenant-ID` scopes visibility.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use githook_core::{Error, EventStatus, TenantCtx};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::state::AppState;

/// Routes under `/api/v1`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/rules", get(list_rules))
        .route("/api/v1/rules/{id}", get(get_rule))
        .route("/api/v1/drivers", get(list_drivers))
        .route("/api/v1/drivers/{id}", get(get_driver))
        .route("/api/v1/event-logs/{id}/status", post(update_event_log_status))
        .route("/api/v1/installations/{provider}/{id}", get(get_installation))
        .route("/api/v1/scm-client/{provider}/{id}", get(get_scm_client))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<TenantCtx, StatusCode> {
    if let Some(expected) = &state.config.api_key {
        let presented = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let key_ok: bool = presented
            .as_bytes()
            .ct_eq(expected.as_bytes())
            .into();
        let bearer_ok = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("Bearer "));
        if !key_ok && !bearer_ok {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(TenantCtx::global, TenantCtx::new))
}

fn store_error(e: &Error) -> StatusCode {
    match e {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn list_rules(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let rules = state
        .rules
        .list(&tenant)
        .await
        .map_err(|e| store_error(&e))?;
    Ok(Json(json!({ "rules": rules })))
}

async fn get_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let rule = state
        .rules
        .get(&tenant, &id)
        .await
        .map_err(|e| store_error(&e))?;
    Ok(Json(json!({ "rule": rule })))
}

async fn list_drivers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let drivers = state
        .drivers
        .list(&tenant)
        .await
        .map_err(|e| store_error(&e))?;
    Ok(Json(json!({ "drivers": drivers })))
}

async fn get_driver(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let driver = state
        .drivers
        .get(&tenant, &id)
        .await
        .map_err(|e| store_error(&e))?;
    Ok(Json(json!({ "driver": driver })))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: EventStatus,
    #[serde(default)]
    error_message: Option<String>,
}

async fn update_event_log_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    state
        .event_logs
        .transition(&tenant, &id, update.status, update.error_message)
        .await
        .map_err(|e| store_error(&e))?;
    Ok(Json(json!({"status": "ok"})))
}

async fn get_installation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((provider, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let mut installation = state
        .installations
        .get_by_installation_id(&tenant, &provider, &id)
        .await
        .map_err(|e| store_error(&e))?;
    // Tokens stay server-side; `GetSCMClient` hands out short-lived ones.
    installation.access_token = None;
    installation.refresh_token = None;
    Ok(Json(json!({ "installation": installation })))
}

/// Resolve a live SCM token for `installation`, for worker-side client
/// construction.
async fn get_scm_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((provider, id)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let installation = state
        .installations
        .get_by_installation_id(&tenant, &provider, &id)
        .await
        .map_err(|e| store_error(&e))?;
    let instance = state
        .instances
        .get(&tenant, &provider, &installation.instance_key)
        .await
        .map_err(|e| store_error(&e))?;

    let client = state
        .authenticator
        .client_for(&instance, &installation)
        .await
        .map_err(|e| {
            warn!(provider = %provider, installation_id = %id, error = %e, "scm client build failed");
            match e {
                Error::AuthConfigMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                Error::TokenExchange { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        })?;

    let api_base_url = instance
        .config
        .get("api_base_url")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let token = match &client {
        githook_auth::ProviderClient::Github(c) => c.token().to_string(),
        _ => installation.access_token.clone().unwrap_or_default(),
    };
    Ok(Json(json!({
        "provider": provider,
        "installation_id": id,
        "api_base_url": api_base_url,
        "token": token,
    })))
}
