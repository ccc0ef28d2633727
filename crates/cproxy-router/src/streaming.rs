//! Pumps an upstream SSE body through a rewriter state machine and frames
//! the result for the client.
//!
//! Bodies are piped, never buffered whole. If the client goes away the
//! send fails, the pump stops reading, and dropping the upstream receiver
//! cancels the upstream call. The admission guard travels with the pump
//! task so teardown fires on every exit path.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use http::{StatusCode, header};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use cproxy_core::admission::AdmissionGuard;
use cproxy_core::decorate;
use cproxy_core::telemetry::{Outcome, StreamStats};
use cproxy_protocol::claude::stream::{ContentBlockDelta, StreamEvent, StreamEventKnown};
use cproxy_protocol::sse::SseParser;
use cproxy_transform::chat::stream::{ChatStreamOutput, ChatStreamState};
use cproxy_transform::responses::stream::ResponsesStreamState;
use cproxy_protocol::openai::responses::ResponsesStreamEvent;

use crate::AppState;
use crate::handlers::{RequestContext, record};

const CHANNEL_CAPACITY: usize = 32;
const DONE_FRAME: &str = "data: [DONE]\n\n";

pub fn chat_stream(
    state: AppState,
    context: RequestContext,
    guard: AdmissionGuard,
    mut upstream: mpsc::Receiver<Bytes>,
    created: i64,
) -> Response {
    let (sender, receiver) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let _guard = guard;
        let mut parser = SseParser::new();
        let mut machine = ChatStreamState::new(created);
        let mut outcome = Outcome::Ok;
        let mut done = false;

        'pump: while let Some(chunk) = upstream.recv().await {
            for event in parser.push_bytes(&chunk) {
                let Some(parsed) = parse_event(&event.data) else {
                    continue;
                };
                for output in machine.transform_event(parsed) {
                    match output {
                        ChatStreamOutput::Chunk(chunk) => {
                            let Ok(json) = serde_json::to_string(&chunk) else {
                                continue;
                            };
                            if send(&sender, format!("data: {json}\n\n")).await.is_err() {
                                outcome = Outcome::ClientDisconnected;
                                break 'pump;
                            }
                        }
                        ChatStreamOutput::Done => {
                            let _ = send(&sender, DONE_FRAME.to_string()).await;
                            done = true;
                            break 'pump;
                        }
                    }
                }
            }
        }

        if !done && outcome == Outcome::Ok {
            // The upstream closed without message_stop. Finish the stream in
            // shape rather than tearing it down.
            warn!("upstream stream ended early; emitting error chunk");
            outcome = Outcome::Error;
            let error = cproxy_protocol::claude::ErrorDetail {
                r#type: "upstream_interrupted".to_string(),
                message: "upstream stream ended unexpectedly".to_string(),
            };
            for output in machine.transform_event(StreamEvent::Known(StreamEventKnown::Error {
                error,
            })) {
                if let ChatStreamOutput::Chunk(chunk) = output {
                    if let Ok(json) = serde_json::to_string(&chunk) {
                        let _ = send(&sender, format!("data: {json}\n\n")).await;
                    }
                }
            }
            let _ = send(&sender, DONE_FRAME.to_string()).await;
        }

        let usage = machine.usage().clone();
        record(
            &state,
            &context,
            200,
            outcome,
            StreamStats {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                stop_reason: None,
                text_chars: 0,
            },
        );
    });

    sse_response(receiver)
}

pub fn responses_stream(
    state: AppState,
    context: RequestContext,
    guard: AdmissionGuard,
    mut upstream: mpsc::Receiver<Bytes>,
    created_at: i64,
) -> Response {
    let (sender, receiver) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let _guard = guard;
        let mut parser = SseParser::new();
        let mut machine = ResponsesStreamState::new(created_at);
        let mut outcome = Outcome::Ok;
        let mut done = false;

        'pump: while let Some(chunk) = upstream.recv().await {
            for event in parser.push_bytes(&chunk) {
                let Some(parsed) = parse_event(&event.data) else {
                    continue;
                };
                for out in machine.transform_event(parsed) {
                    let terminal = matches!(
                        out,
                        ResponsesStreamEvent::Completed { .. } | ResponsesStreamEvent::Error { .. }
                    );
                    if send_named(&sender, &out).await.is_err() {
                        outcome = Outcome::ClientDisconnected;
                        break 'pump;
                    }
                    if terminal {
                        done = true;
                        break 'pump;
                    }
                }
            }
        }

        if !done && outcome == Outcome::Ok {
            warn!("upstream stream ended early; emitting response.error");
            outcome = Outcome::Error;
            let error = cproxy_protocol::claude::ErrorDetail {
                r#type: "upstream_interrupted".to_string(),
                message: "upstream stream ended unexpectedly".to_string(),
            };
            for out in machine.transform_event(StreamEvent::Known(StreamEventKnown::Error {
                error,
            })) {
                let _ = send_named(&sender, &out).await;
            }
        }

        let usage = machine.usage().clone();
        record(
            &state,
            &context,
            200,
            outcome,
            StreamStats {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                stop_reason: None,
                text_chars: 0,
            },
        );
    });

    sse_response(receiver)
}

/// Native pass-through: reframe each upstream event with the tool-name
/// prefix stripped, sniffing usage and stop reason along the way.
pub fn messages_stream(
    state: AppState,
    context: RequestContext,
    guard: AdmissionGuard,
    mut upstream: mpsc::Receiver<Bytes>,
) -> Response {
    let (sender, receiver) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let _guard = guard;
        let mut parser = SseParser::new();
        let mut stats = StreamStats::default();
        let mut outcome = Outcome::Ok;

        'pump: while let Some(chunk) = upstream.recv().await {
            for event in parser.push_bytes(&chunk) {
                let stripped = cproxy_protocol::sse::SseEvent {
                    event: event.event.clone(),
                    data: decorate::strip_tool_prefix(&event.data),
                };
                sniff_native(&stripped.data, &mut stats);
                if send(&sender, stripped.to_frame()).await.is_err() {
                    outcome = Outcome::ClientDisconnected;
                    break 'pump;
                }
            }
        }
        for event in parser.finish() {
            let data = decorate::strip_tool_prefix(&event.data);
            sniff_native(&data, &mut stats);
            let _ = send(
                &sender,
                cproxy_protocol::sse::SseEvent {
                    event: event.event,
                    data,
                }
                .to_frame(),
            )
            .await;
        }

        debug!(
            input_tokens = stats.input_tokens,
            output_tokens = stats.output_tokens,
            "native stream finished"
        );
        record(&state, &context, 200, outcome, stats);
    });

    sse_response(receiver)
}

fn parse_event(data: &str) -> Option<StreamEvent> {
    if data.is_empty() {
        return None;
    }
    let stripped = decorate::strip_tool_prefix(data);
    match serde_json::from_str(&stripped) {
        Ok(event) => Some(event),
        Err(err) => {
            debug!(error = %err, "skipping unparseable stream event");
            None
        }
    }
}

fn sniff_native(data: &str, stats: &mut StreamStats) {
    let Ok(StreamEvent::Known(event)) = serde_json::from_str::<StreamEvent>(data) else {
        return;
    };
    match event {
        StreamEventKnown::MessageStart { message } => {
            if message.usage.input_tokens.is_some() {
                stats.input_tokens = message.usage.input_tokens;
            }
        }
        StreamEventKnown::MessageDelta { delta, usage } => {
            if usage.output_tokens.is_some() {
                stats.output_tokens = usage.output_tokens;
            }
            if let Some(reason) = delta.stop_reason {
                stats.stop_reason = serde_json::to_value(reason)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string));
            }
        }
        StreamEventKnown::ContentBlockDelta {
            delta: ContentBlockDelta::TextDelta { text },
            ..
        } => {
            stats.text_chars += text.chars().count();
        }
        _ => {}
    }
}

async fn send(sender: &mpsc::Sender<Bytes>, frame: String) -> Result<(), ()> {
    sender
        .send(Bytes::from(frame.into_bytes()))
        .await
        .map_err(|_| ())
}

async fn send_named(
    sender: &mpsc::Sender<Bytes>,
    event: &ResponsesStreamEvent,
) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(event) else {
        return Ok(());
    };
    send(sender, format!("event: {}\ndata: {json}\n\n", event.name())).await
}

fn sse_response(receiver: mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(receiver).map(Ok::<_, std::convert::Infallible>);
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
