//! HTTP router and webhook handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use githook_core::TenantCtx;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::api;
use crate::pipeline;
use crate::providers::Provider;
use crate::state::AppState;

/// Build the HTTP router for the webhook server.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.max_body_bytes;
    Router::new()
        // Webhook endpoints, with and without an explicit instance key.
        .route("/webhook/{provider}", post(webhook_handler))
        .route("/webhook/{provider}/{instance}", post(webhook_instance_handler))
        // Control-plane API consumed by the worker SDK.
        .merge(api::router())
        // Health checks.
        .route("/healthz", get(health_check).head(health_check))
        .route("/readyz", get(health_check).head(health_check))
        // OAuth start; the callback handlers live in the install-flow
        // service, this only bounces the browser there.
        .route("/", get(oauth_start))
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Redirect `GET /` to the OAuth install flow when configured.
async fn oauth_start(State(state): State<AppState>) -> Response {
    match &state.config.oauth_start_url {
        Some(url) => Redirect::temporary(url).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "error": "oauth start url not configured"})),
        )
            .into_response(),
    }
}

fn tenant_from(headers: &HeaderMap) -> TenantCtx {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(TenantCtx::global, TenantCtx::new)
}

/// `POST /webhook/{provider}`.
async fn webhook_handler(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_pipeline(&state, &provider, None, &headers, &body).await
}

/// `POST /webhook/{provider}/{instance}`.
async fn webhook_instance_handler(
    State(state): State<AppState>,
    Path((provider, instance)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_pipeline(&state, &provider, Some(instance), &headers, &body).await
}

async fn run_pipeline(
    state: &AppState,
    provider: &str,
    instance: Option<String>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let Some(provider) = Provider::from_path(provider) else {
        debug!(provider = %provider, "unknown webhook provider");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "rejected", "reason": "unknown_provider"})),
        )
            .into_response();
    };
    let tenant = tenant_from(headers);
    let outcome = pipeline::ingest(
        state,
        provider,
        instance.as_deref(),
        tenant,
        headers,
        body,
    )
    .await;
    (outcome.status, Json(outcome.body)).into_response()
}
