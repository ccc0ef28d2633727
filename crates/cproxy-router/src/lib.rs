//! HTTP surface: route table, local-key authentication, and dispatch into
//! the translation pipeline.

pub mod handlers;
pub mod streaming;

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http::{HeaderMap, StatusCode, header};

use cproxy_core::admission::AdmissionController;
use cproxy_core::telemetry::SharedSink;
use cproxy_core::upstream::UpstreamClient;
use cproxy_core::watcher::Snapshot;

#[derive(Clone)]
pub struct AppState {
    pub snapshot: Arc<ArcSwap<Snapshot>>,
    pub admission: Arc<AdmissionController>,
    pub upstream: Arc<UpstreamClient>,
    pub telemetry: SharedSink,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/models", get(handlers::models))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/responses", post(handlers::responses))
        .route("/messages", post(handlers::messages))
        .layer(middleware::from_fn_with_state(state.clone(), local_auth))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .nest("/v1", v1)
}

async fn health() -> Response {
    axum::Json(serde_json::json!({"status": "ok"})).into_response()
}

/// Local-caller authentication. Active only when a key is configured;
/// accepts `Authorization: Bearer <key>` or `x-api-key: <key>`.
async fn local_auth(
    State(state): State<AppState>,
    request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let configured = state.snapshot.load().api_key.clone();
    let Some(record) = configured else {
        return next.run(request).await;
    };

    match presented_key(request.headers()) {
        Some(presented) if presented == record.key => next.run(request).await,
        _ => invalid_api_key(),
    }
}

fn presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn invalid_api_key() -> Response {
    let body = serde_json::json!({
        "error": {
            "code": "invalid_api_key",
            "type": "invalid_request_error",
            "message": "invalid or missing local API key",
        }
    });
    (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
}
