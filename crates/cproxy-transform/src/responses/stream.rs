//! Per-response state machine turning upstream stream events into the
//! Responses event vocabulary.
//!
//! Message-item creation is lazy: a response consisting purely of tool
//! calls never emits a message item. Every emitted event carries the next
//! value of a contiguous sequence counter starting at zero.

use std::collections::BTreeMap;

use cproxy_protocol::claude::stream::{
    ContentBlockDelta, StreamContentBlock, StreamEvent, StreamEventKnown, StreamUsage,
};
use cproxy_protocol::claude::{ErrorDetail, StopReason};
use cproxy_protocol::openai::responses::{
    ContentPart, FunctionCallItem, OutputItem, OutputMessageItem, OutputRole, ResponseObjectType,
    ResponseStatus, ResponsesResponse, ResponsesStreamEvent, ResponsesUsage,
};

use crate::responses::response::map_status;

#[derive(Debug, Clone)]
struct PendingToolCall {
    output_index: i64,
    call_id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
pub struct ResponsesStreamState {
    id: String,
    model: String,
    created_at: i64,
    sequence_number: i64,
    next_output_index: i64,
    message: Option<MessageState>,
    pending_tools: BTreeMap<u32, PendingToolCall>,
    output_items: Vec<OutputItem>,
    stop_reason: Option<StopReason>,
    usage: StreamUsage,
    finished: bool,
}

#[derive(Debug)]
struct MessageState {
    item_id: String,
    output_index: i64,
    block_index: Option<u32>,
    text: String,
    closed: bool,
}

impl ResponsesStreamState {
    pub fn new(created_at: i64) -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created_at,
            sequence_number: 0,
            next_output_index: 0,
            message: None,
            pending_tools: BTreeMap::new(),
            output_items: Vec::new(),
            stop_reason: None,
            usage: StreamUsage::default(),
            finished: false,
        }
    }

    pub fn transform_event(&mut self, event: StreamEvent) -> Vec<ResponsesStreamEvent> {
        let event = match event {
            StreamEvent::Known(event) => event,
            StreamEvent::Unknown(_) => return Vec::new(),
        };

        match event {
            StreamEventKnown::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                if let Some(input_tokens) = message.usage.input_tokens {
                    self.usage.input_tokens = Some(input_tokens);
                }
                let response = self.skeleton(ResponseStatus::InProgress, None);
                vec![ResponsesStreamEvent::Created {
                    response,
                    sequence_number: self.next_sequence(),
                }]
            }
            StreamEventKnown::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamContentBlock::Text(text) => self.emit_text(index, text.text),
                StreamContentBlock::ToolUse(tool) => self.start_tool(index, tool.id, tool.name),
                _ => Vec::new(),
            },
            StreamEventKnown::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } => self.emit_text(index, text),
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(pending) = self.pending_tools.get_mut(&index) {
                        pending.arguments.push_str(&partial_json);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEventKnown::ContentBlockStop { index } => {
                if let Some(pending) = self.pending_tools.remove(&index) {
                    self.finish_tool(pending)
                } else if matches!(&self.message, Some(m) if m.block_index == Some(index)) {
                    self.close_message()
                } else {
                    Vec::new()
                }
            }
            StreamEventKnown::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if usage.input_tokens.is_some() {
                    self.usage.input_tokens = usage.input_tokens;
                }
                if usage.output_tokens.is_some() {
                    self.usage.output_tokens = usage.output_tokens;
                }
                Vec::new()
            }
            StreamEventKnown::MessageStop => self.finish(),
            StreamEventKnown::Ping => Vec::new(),
            StreamEventKnown::Error { error } => {
                self.finished = true;
                vec![self.error_event(error)]
            }
        }
    }

    pub fn usage(&self) -> &StreamUsage {
        &self.usage
    }

    fn emit_text(&mut self, block_index: u32, text: String) -> Vec<ResponsesStreamEvent> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        let needs_message = match &self.message {
            Some(message) => message.closed,
            None => true,
        };
        if needs_message {
            let item_id = format!("{}_msg", self.id);
            let output_index = self.next_output_index;
            self.next_output_index += 1;
            self.message = Some(MessageState {
                item_id: item_id.clone(),
                output_index,
                block_index: Some(block_index),
                text: String::new(),
                closed: false,
            });
            events.push(ResponsesStreamEvent::OutputItemAdded {
                output_index,
                item: OutputItem::Message(OutputMessageItem {
                    id: item_id.clone(),
                    role: OutputRole::Assistant,
                    status: ResponseStatus::InProgress,
                    content: Vec::new(),
                }),
                sequence_number: self.next_sequence(),
            });
            events.push(ResponsesStreamEvent::ContentPartAdded {
                item_id,
                output_index,
                content_index: 0,
                part: ContentPart::OutputText {
                    text: String::new(),
                    annotations: Vec::new(),
                },
                sequence_number: self.next_sequence(),
            });
        }

        let (item_id, output_index) = match &mut self.message {
            Some(message) => {
                message.text.push_str(&text);
                (message.item_id.clone(), message.output_index)
            }
            None => return events,
        };
        events.push(ResponsesStreamEvent::OutputTextDelta {
            item_id,
            output_index,
            content_index: 0,
            delta: text,
            sequence_number: self.next_sequence(),
        });
        events
    }

    fn close_message(&mut self) -> Vec<ResponsesStreamEvent> {
        let Some(message) = self.message.as_mut() else {
            return Vec::new();
        };
        if message.closed {
            return Vec::new();
        }
        message.closed = true;
        let item_id = message.item_id.clone();
        let output_index = message.output_index;
        let text = message.text.clone();

        let item = OutputItem::Message(OutputMessageItem {
            id: item_id.clone(),
            role: OutputRole::Assistant,
            status: ResponseStatus::Completed,
            content: vec![ContentPart::OutputText {
                text: text.clone(),
                annotations: Vec::new(),
            }],
        });
        self.output_items.push(item.clone());

        vec![
            ResponsesStreamEvent::ContentPartDone {
                item_id: item_id.clone(),
                output_index,
                content_index: 0,
                part: ContentPart::OutputText {
                    text,
                    annotations: Vec::new(),
                },
                sequence_number: self.next_sequence(),
            },
            ResponsesStreamEvent::OutputItemDone {
                output_index,
                item,
                sequence_number: self.next_sequence(),
            },
        ]
    }

    fn start_tool(&mut self, index: u32, id: String, name: String) -> Vec<ResponsesStreamEvent> {
        let output_index = self.next_output_index;
        self.next_output_index += 1;

        let item = OutputItem::FunctionCall(FunctionCallItem {
            id: Some(id.clone()),
            call_id: id.clone(),
            name: name.clone(),
            arguments: String::new(),
            status: Some("in_progress".to_string()),
        });
        self.pending_tools.insert(
            index,
            PendingToolCall {
                output_index,
                call_id: id,
                name,
                arguments: String::new(),
            },
        );

        vec![ResponsesStreamEvent::OutputItemAdded {
            output_index,
            item,
            sequence_number: self.next_sequence(),
        }]
    }

    fn finish_tool(&mut self, pending: PendingToolCall) -> Vec<ResponsesStreamEvent> {
        let arguments = if pending.arguments.is_empty() {
            "{}".to_string()
        } else {
            pending.arguments
        };
        let item = OutputItem::FunctionCall(FunctionCallItem {
            id: Some(pending.call_id.clone()),
            call_id: pending.call_id.clone(),
            name: pending.name.clone(),
            arguments: arguments.clone(),
            status: Some("completed".to_string()),
        });
        self.output_items.push(item.clone());

        vec![
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                item_id: pending.call_id,
                output_index: pending.output_index,
                name: pending.name,
                arguments,
                sequence_number: self.next_sequence(),
            },
            ResponsesStreamEvent::OutputItemDone {
                output_index: pending.output_index,
                item,
                sequence_number: self.next_sequence(),
            },
        ]
    }

    fn finish(&mut self) -> Vec<ResponsesStreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = self.close_message();
        let status = map_status(self.stop_reason);
        let usage = match (self.usage.input_tokens, self.usage.output_tokens) {
            (None, None) => None,
            (input, output) => {
                let input = input.unwrap_or(0);
                let output = output.unwrap_or(0);
                Some(ResponsesUsage {
                    input_tokens: input,
                    output_tokens: output,
                    total_tokens: input + output,
                })
            }
        };
        let response = self.skeleton(status, usage);
        events.push(ResponsesStreamEvent::Completed {
            response,
            sequence_number: self.next_sequence(),
        });
        events
    }

    fn error_event(&mut self, error: ErrorDetail) -> ResponsesStreamEvent {
        ResponsesStreamEvent::Error {
            code: Some(error.r#type),
            message: error.message,
            sequence_number: self.next_sequence(),
        }
    }

    fn skeleton(&self, status: ResponseStatus, usage: Option<ResponsesUsage>) -> ResponsesResponse {
        let output_text = self
            .message
            .as_ref()
            .filter(|message| !message.text.is_empty())
            .map(|message| message.text.clone());
        ResponsesResponse {
            id: self.id.clone(),
            object: ResponseObjectType::Response,
            created_at: self.created_at,
            status,
            model: self.model.clone(),
            output: self.output_items.clone(),
            output_text,
            usage,
            error: None,
        }
    }

    fn next_sequence(&mut self) -> i64 {
        let value = self.sequence_number;
        self.sequence_number += 1;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cproxy_protocol::claude::stream::{MessageDeltaBody, StreamMessage};
    use cproxy_protocol::claude::{
        MessageType, ResponseRole, TextBlock, TextBlockType, ToolUseBlock, ToolUseBlockType,
    };

    fn known(event: StreamEventKnown) -> StreamEvent {
        StreamEvent::Known(event)
    }

    fn start_event() -> StreamEvent {
        known(StreamEventKnown::MessageStart {
            message: StreamMessage {
                id: "msg_1".into(),
                content: Vec::new(),
                model: "claude-sonnet-4-5".into(),
                role: ResponseRole::Assistant,
                stop_reason: None,
                stop_sequence: None,
                r#type: MessageType::Message,
                usage: StreamUsage {
                    input_tokens: Some(3),
                    ..StreamUsage::default()
                },
            },
        })
    }

    fn run_text_and_tool() -> Vec<ResponsesStreamEvent> {
        let mut state = ResponsesStreamState::new(0);
        let mut events = Vec::new();
        events.extend(state.transform_event(start_event()));
        events.extend(
            state.transform_event(known(StreamEventKnown::ContentBlockStart {
                index: 0,
                content_block: StreamContentBlock::Text(TextBlock {
                    text: String::new(),
                    r#type: TextBlockType::Text,
                }),
            })),
        );
        events.extend(
            state.transform_event(known(StreamEventKnown::ContentBlockDelta {
                index: 0,
                delta: ContentBlockDelta::TextDelta { text: "Hi".into() },
            })),
        );
        events.extend(state.transform_event(known(StreamEventKnown::ContentBlockStop { index: 0 })));
        events.extend(
            state.transform_event(known(StreamEventKnown::ContentBlockStart {
                index: 1,
                content_block: StreamContentBlock::ToolUse(ToolUseBlock {
                    id: "call_7".into(),
                    input: serde_json::json!({}),
                    name: "get_weather".into(),
                    r#type: ToolUseBlockType::ToolUse,
                }),
            })),
        );
        events.extend(
            state.transform_event(known(StreamEventKnown::ContentBlockDelta {
                index: 1,
                delta: ContentBlockDelta::InputJsonDelta {
                    partial_json: r#"{"city":"NYC"}"#.into(),
                },
            })),
        );
        events.extend(state.transform_event(known(StreamEventKnown::ContentBlockStop { index: 1 })));
        events.extend(
            state.transform_event(known(StreamEventKnown::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(StopReason::ToolUse),
                    stop_sequence: None,
                },
                usage: StreamUsage {
                    output_tokens: Some(7),
                    ..StreamUsage::default()
                },
            })),
        );
        events.extend(state.transform_event(known(StreamEventKnown::MessageStop)));
        events
    }

    #[test]
    fn sequence_numbers_contiguous_from_zero() {
        let events = run_text_and_tool();
        for (expected, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_number(), expected as i64);
        }
    }

    #[test]
    fn event_order_matches_vocabulary() {
        let names: Vec<&str> = run_text_and_tool().iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            [
                "response.created",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.content_part.done",
                "response.output_item.done",
                "response.output_item.added",
                "response.function_call_arguments.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
    }

    #[test]
    fn completed_carries_output_and_usage() {
        let events = run_text_and_tool();
        match events.last().unwrap() {
            ResponsesStreamEvent::Completed { response, .. } => {
                assert_eq!(response.output.len(), 2);
                let usage = response.usage.as_ref().unwrap();
                assert_eq!(usage.input_tokens, 3);
                assert_eq!(usage.output_tokens, 7);
                assert_eq!(usage.total_tokens, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn pure_tool_call_stream_creates_no_message_item() {
        let mut state = ResponsesStreamState::new(0);
        let mut events = Vec::new();
        events.extend(state.transform_event(start_event()));
        events.extend(
            state.transform_event(known(StreamEventKnown::ContentBlockStart {
                index: 0,
                content_block: StreamContentBlock::ToolUse(ToolUseBlock {
                    id: "call_1".into(),
                    input: serde_json::json!({}),
                    name: "f".into(),
                    r#type: ToolUseBlockType::ToolUse,
                }),
            })),
        );
        events.extend(state.transform_event(known(StreamEventKnown::ContentBlockStop { index: 0 })));
        events.extend(state.transform_event(known(StreamEventKnown::MessageStop)));

        assert!(events.iter().all(|event| {
            !matches!(
                event,
                ResponsesStreamEvent::OutputItemAdded {
                    item: OutputItem::Message(_),
                    ..
                }
            )
        }));
    }

    #[test]
    fn upstream_error_becomes_error_event() {
        let mut state = ResponsesStreamState::new(0);
        state.transform_event(start_event());
        let events = state.transform_event(known(StreamEventKnown::Error {
            error: ErrorDetail {
                r#type: "overloaded_error".into(),
                message: "try later".into(),
            },
        }));
        match &events[0] {
            ResponsesStreamEvent::Error { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("overloaded_error"));
                assert_eq!(message, "try later");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
