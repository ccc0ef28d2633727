use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::StatusCode;
use serde_json::Value as JsonValue;
use tracing::warn;

use cproxy_core::ProxyError;
use cproxy_core::admission::{Admission, AdmissionGuard};
use cproxy_core::decorate::{self, Endpoint};
use cproxy_core::session;
use cproxy_core::telemetry::{Outcome, RequestRecord, StreamStats};
use cproxy_core::upstream::UpstreamBody;
use cproxy_protocol::claude::Message;
use cproxy_protocol::openai::chat::ChatCompletionRequest;
use cproxy_protocol::openai::responses::ResponsesRequest;
use cproxy_transform::{chat, responses as responses_transform};

use crate::{AppState, streaming};

/// Error envelope flavours per outbound protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    OpenAi,
    Anthropic,
}

pub async fn models(State(state): State<AppState>) -> Response {
    let snapshot = state.snapshot.load();
    let mut ids: Vec<String> = snapshot.config.model_mapping.keys().cloned().collect();
    for target in snapshot.config.model_mapping.values() {
        if !ids.contains(target) {
            ids.push(target.clone());
        }
    }
    if ids.is_empty() {
        ids = vec![
            "claude-opus-4-1".to_string(),
            "claude-sonnet-4-5".to_string(),
            "claude-haiku-4-5".to_string(),
        ];
    }

    let data: Vec<JsonValue> = ids
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "anthropic",
            })
        })
        .collect();
    axum::Json(serde_json::json!({"object": "list", "data": data})).into_response()
}

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let raw: JsonValue = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => return bad_request(Wire::OpenAi, &format!("malformed JSON: {err}")),
    };
    let request: ChatCompletionRequest = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(err) => return bad_request(Wire::OpenAi, &err.to_string()),
    };

    let guard = match admit(&state, &raw, &body, Wire::OpenAi) {
        Ok(guard) => guard,
        Err(response) => return response,
    };

    let model = state
        .snapshot
        .load()
        .config
        .map_model(&request.model)
        .to_string();
    let want_stream = request.stream.unwrap_or(false);
    let claude_body = chat::request::transform_request(request, model.clone());
    let prepared = match prepare_body(&claude_body, Endpoint::ChatCompletions) {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    let context = RequestContext {
        endpoint: "/v1/chat/completions",
        model,
        started: Instant::now(),
    };
    match state.upstream.post_messages(prepared, want_stream).await {
        Ok(reply) => match reply.body {
            UpstreamBody::Bytes(bytes) => {
                let message = match parse_upstream_message(&bytes, Wire::OpenAi) {
                    Ok(message) => message,
                    Err(response) => return response,
                };
                record(&state, &context, reply.status, Outcome::Ok, sniff(&message));
                drop(guard);
                axum::Json(chat::response::transform_response(message, unix_now())).into_response()
            }
            UpstreamBody::Stream(receiver) => {
                streaming::chat_stream(state.clone(), context, guard, receiver, unix_now())
            }
        },
        Err(err) => {
            record(&state, &context, 0, Outcome::Error, StreamStats::default());
            drop(guard);
            render_error(Wire::OpenAi, err)
        }
    }
}

pub async fn responses(State(state): State<AppState>, body: Bytes) -> Response {
    let raw: JsonValue = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => return bad_request(Wire::OpenAi, &format!("malformed JSON: {err}")),
    };
    let request: ResponsesRequest = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(err) => return bad_request(Wire::OpenAi, &err.to_string()),
    };

    let guard = match admit(&state, &raw, &body, Wire::OpenAi) {
        Ok(guard) => guard,
        Err(response) => return response,
    };

    let model = state
        .snapshot
        .load()
        .config
        .map_model(&request.model)
        .to_string();
    let want_stream = request.stream.unwrap_or(false);
    let claude_body = responses_transform::request::transform_request(request, model.clone());
    let prepared = match prepare_body(&claude_body, Endpoint::Responses) {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    let context = RequestContext {
        endpoint: "/v1/responses",
        model,
        started: Instant::now(),
    };
    match state.upstream.post_messages(prepared, want_stream).await {
        Ok(reply) => match reply.body {
            UpstreamBody::Bytes(bytes) => {
                let message = match parse_upstream_message(&bytes, Wire::OpenAi) {
                    Ok(message) => message,
                    Err(response) => return response,
                };
                record(&state, &context, reply.status, Outcome::Ok, sniff(&message));
                drop(guard);
                axum::Json(responses_transform::response::transform_response(
                    message,
                    unix_now(),
                ))
                .into_response()
            }
            UpstreamBody::Stream(receiver) => {
                streaming::responses_stream(state.clone(), context, guard, receiver, unix_now())
            }
        },
        Err(err) => {
            record(&state, &context, 0, Outcome::Error, StreamStats::default());
            drop(guard);
            render_error(Wire::OpenAi, err)
        }
    }
}

/// Native pass-through: decorate on the way in, strip on the way out.
pub async fn messages(State(state): State<AppState>, body: Bytes) -> Response {
    let mut raw: JsonValue = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => return bad_request(Wire::Anthropic, &format!("malformed JSON: {err}")),
    };
    if !raw.is_object() {
        return bad_request(Wire::Anthropic, "request body must be a JSON object");
    }

    let guard = match admit(&state, &raw, &body, Wire::Anthropic) {
        Ok(guard) => guard,
        Err(response) => return response,
    };

    let model = raw
        .get("model")
        .and_then(|model| model.as_str())
        .unwrap_or_default()
        .to_string();
    let mapped = state.snapshot.load().config.map_model(&model).to_string();
    if let Some(object) = raw.as_object_mut() {
        object.insert("model".to_string(), JsonValue::String(mapped.clone()));
    }
    let want_stream = raw
        .get("stream")
        .and_then(|stream| stream.as_bool())
        .unwrap_or(false);

    decorate::decorate_request(&mut raw, Endpoint::Messages);
    let prepared = match serde_json::to_vec(&raw) {
        Ok(prepared) => Bytes::from(prepared),
        Err(err) => return bad_request(Wire::Anthropic, &err.to_string()),
    };

    let context = RequestContext {
        endpoint: "/v1/messages",
        model: mapped,
        started: Instant::now(),
    };
    match state.upstream.post_messages(prepared, want_stream).await {
        Ok(reply) => match reply.body {
            UpstreamBody::Bytes(bytes) => {
                let text = decorate::strip_tool_prefix(&String::from_utf8_lossy(&bytes));
                let stats = serde_json::from_str::<Message>(&text)
                    .map(|message| sniff(&message))
                    .unwrap_or_default();
                record(&state, &context, reply.status, Outcome::Ok, stats);
                drop(guard);
                json_text_response(StatusCode::OK, text)
            }
            UpstreamBody::Stream(receiver) => {
                streaming::messages_stream(state.clone(), context, guard, receiver)
            }
        },
        Err(err) => {
            record(&state, &context, 0, Outcome::Error, StreamStats::default());
            drop(guard);
            render_error(Wire::Anthropic, err)
        }
    }
}

pub struct RequestContext {
    pub endpoint: &'static str,
    pub model: String,
    pub started: Instant,
}

fn admit(
    state: &AppState,
    raw: &JsonValue,
    body: &Bytes,
    wire: Wire,
) -> Result<AdmissionGuard, Response> {
    let session_key = session::session_key(raw);
    match state.admission.begin(&session_key, body) {
        Admission::Accepted => Ok(AdmissionGuard::new(state.admission.clone(), session_key)),
        Admission::Rejected { reason } => {
            warn!(session = %session_key, reason = %reason, "request rejected");
            Err(throttled(wire, &reason))
        }
    }
}

fn prepare_body<T: serde::Serialize>(body: &T, endpoint: Endpoint) -> Result<Bytes, Response> {
    let mut value = serde_json::to_value(body)
        .map_err(|err| render_error(Wire::OpenAi, ProxyError::BadRequest(err.to_string())))?;
    decorate::decorate_request(&mut value, endpoint);
    let bytes = serde_json::to_vec(&value)
        .map_err(|err| render_error(Wire::OpenAi, ProxyError::BadRequest(err.to_string())))?;
    Ok(Bytes::from(bytes))
}

fn parse_upstream_message(bytes: &Bytes, wire: Wire) -> Result<Message, Response> {
    let text = decorate::strip_tool_prefix(&String::from_utf8_lossy(bytes));
    serde_json::from_str::<Message>(&text).map_err(|err| {
        warn!(error = %err, "upstream response did not parse as a message");
        render_error(
            wire,
            ProxyError::UpstreamFatal {
                status: 502,
                body: Bytes::from(text.into_bytes()),
            },
        )
    })
}

pub fn sniff(message: &Message) -> StreamStats {
    StreamStats {
        input_tokens: Some(message.usage.input_tokens),
        output_tokens: Some(message.usage.output_tokens),
        stop_reason: message
            .stop_reason
            .and_then(|reason| serde_json::to_value(reason).ok())
            .and_then(|value| value.as_str().map(str::to_string)),
        text_chars: 0,
    }
}

pub fn record(
    state: &AppState,
    context: &RequestContext,
    status: u16,
    outcome: Outcome,
    stats: StreamStats,
) {
    state.telemetry.record(&RequestRecord {
        trace_id: uuid::Uuid::now_v7().to_string(),
        endpoint: context.endpoint,
        model: context.model.clone(),
        status,
        outcome,
        started_at: time::OffsetDateTime::now_utc(),
        elapsed: context.started.elapsed(),
        stats,
    });
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn envelope(wire: Wire, r#type: &str, message: &str) -> JsonValue {
    match wire {
        Wire::OpenAi => serde_json::json!({
            "error": {"type": r#type, "message": message}
        }),
        Wire::Anthropic => serde_json::json!({
            "type": "error",
            "error": {"type": r#type, "message": message}
        }),
    }
}

fn bad_request(wire: Wire, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(envelope(wire, "invalid_request_error", message)),
    )
        .into_response()
}

fn throttled(wire: Wire, reason: &str) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(envelope(wire, "rate_limit_error", reason)),
    )
        .into_response()
}

pub fn render_error(wire: Wire, err: ProxyError) -> Response {
    match err {
        ProxyError::NotAuthenticated => (
            StatusCode::UNAUTHORIZED,
            axum::Json(envelope(
                wire,
                "authentication_error",
                "not authenticated; run `cproxy auth login`",
            )),
        )
            .into_response(),
        ProxyError::RefreshFailed(detail) => (
            StatusCode::UNAUTHORIZED,
            axum::Json(envelope(wire, "authentication_error", &detail)),
        )
            .into_response(),
        // The upstream's own 401 body passes through unchanged.
        ProxyError::UpstreamFatal { status: 401, body } => {
            json_text_response(StatusCode::UNAUTHORIZED, upstream_error_text(&body))
        }
        ProxyError::UpstreamFatal { status, body } => {
            warn!(status, "upstream failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(envelope(wire, "api_error", &upstream_error_text(&body))),
            )
                .into_response()
        }
        ProxyError::UpstreamTransient(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(envelope(wire, "api_error", &detail)),
        )
            .into_response(),
        ProxyError::BadRequest(detail) => bad_request(wire, &detail),
        ProxyError::Throttled(reason) => throttled(wire, &reason),
        ProxyError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn upstream_error_text(body: &Bytes) -> String {
    let text = String::from_utf8_lossy(body);
    if text.is_empty() {
        "upstream error".to_string()
    } else {
        text.into_owned()
    }
}

fn json_text_response(status: StatusCode, text: String) -> Response {
    match Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(text))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
