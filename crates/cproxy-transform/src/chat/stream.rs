//! Per-response state machine turning upstream stream events into
//! Chat-Completions chunks.
//!
//! Tool-call arguments are buffered and emitted as one chunk when the call's
//! content block closes, so a client never sees a torn argument string.

use std::collections::BTreeMap;

use cproxy_protocol::claude::stream::{
    ContentBlockDelta, StreamContentBlock, StreamEvent, StreamEventKnown, StreamUsage,
};
use cproxy_protocol::claude::{ErrorDetail, StopReason};
use cproxy_protocol::openai::chat::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkObjectType, CompletionUsage,
    FinishReason, FunctionCallDelta, ResponseRole, ToolCallDelta, ToolCallType,
};

use crate::chat::response::map_finish_reason;

#[derive(Debug, Clone)]
struct PendingToolCall {
    chunk_index: u32,
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
pub struct ChatStreamState {
    id: String,
    model: String,
    created: i64,
    pending_tools: BTreeMap<u32, PendingToolCall>,
    emitted_tool_calls: u32,
    role_emitted: bool,
    any_tool_calls: bool,
    stop_reason: Option<StopReason>,
    usage: StreamUsage,
    finished: bool,
}

/// What the pump should do with the state machine's output.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatStreamOutput {
    Chunk(ChatCompletionChunk),
    /// Terminal: the final chunk was emitted; follow with `data: [DONE]`.
    Done,
}

impl ChatStreamState {
    pub fn new(created: i64) -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created,
            pending_tools: BTreeMap::new(),
            emitted_tool_calls: 0,
            role_emitted: false,
            any_tool_calls: false,
            stop_reason: None,
            usage: StreamUsage::default(),
            finished: false,
        }
    }

    pub fn transform_event(&mut self, event: StreamEvent) -> Vec<ChatStreamOutput> {
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
                Vec::new()
            }
            StreamEventKnown::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StreamContentBlock::Text(text) if !text.text.is_empty() => {
                    vec![ChatStreamOutput::Chunk(self.text_chunk(text.text))]
                }
                StreamContentBlock::ToolUse(tool) => {
                    self.any_tool_calls = true;
                    self.pending_tools.insert(
                        index,
                        PendingToolCall {
                            chunk_index: self.emitted_tool_calls,
                            id: tool.id,
                            name: tool.name,
                            arguments: String::new(),
                        },
                    );
                    self.emitted_tool_calls += 1;
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEventKnown::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![ChatStreamOutput::Chunk(self.text_chunk(text))]
                }
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(pending) = self.pending_tools.get_mut(&index) {
                        pending.arguments.push_str(&partial_json);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEventKnown::ContentBlockStop { index } => {
                match self.pending_tools.remove(&index) {
                    Some(pending) => vec![ChatStreamOutput::Chunk(self.tool_call_chunk(pending))],
                    None => Vec::new(),
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
            StreamEventKnown::MessageStop => {
                if self.finished {
                    return vec![ChatStreamOutput::Done];
                }
                self.finished = true;
                let finish_reason = map_finish_reason(self.stop_reason, self.any_tool_calls);
                vec![
                    ChatStreamOutput::Chunk(self.finish_chunk(finish_reason, None)),
                    ChatStreamOutput::Done,
                ]
            }
            StreamEventKnown::Ping => Vec::new(),
            StreamEventKnown::Error { error } => {
                self.finished = true;
                vec![
                    ChatStreamOutput::Chunk(self.error_chunk(error)),
                    ChatStreamOutput::Done,
                ]
            }
        }
    }

    /// Current token counts, for telemetry.
    pub fn usage(&self) -> &StreamUsage {
        &self.usage
    }

    fn text_chunk(&mut self, text: String) -> ChatCompletionChunk {
        let delta = ChunkDelta {
            role: self.take_role(),
            content: Some(text),
            tool_calls: None,
        };
        self.chunk(delta, None, None)
    }

    fn tool_call_chunk(&mut self, pending: PendingToolCall) -> ChatCompletionChunk {
        let arguments = if pending.arguments.is_empty() {
            "{}".to_string()
        } else {
            pending.arguments
        };
        let delta = ChunkDelta {
            role: self.take_role(),
            content: None,
            tool_calls: Some(vec![ToolCallDelta {
                index: pending.chunk_index,
                id: Some(pending.id),
                r#type: Some(ToolCallType::Function),
                function: Some(FunctionCallDelta {
                    name: Some(pending.name),
                    arguments: Some(arguments),
                }),
            }]),
        };
        self.chunk(delta, None, None)
    }

    fn finish_chunk(
        &mut self,
        finish_reason: FinishReason,
        error: Option<ErrorDetail>,
    ) -> ChatCompletionChunk {
        let usage = match (self.usage.input_tokens, self.usage.output_tokens) {
            (None, None) => None,
            (input, output) => {
                let input = input.unwrap_or(0);
                let output = output.unwrap_or(0);
                Some(CompletionUsage {
                    prompt_tokens: input,
                    completion_tokens: output,
                    total_tokens: input + output,
                })
            }
        };
        let mut chunk = self.chunk(ChunkDelta::default(), Some(finish_reason), usage);
        if let Some(error) = error {
            chunk.error = serde_json::to_value(&error).ok();
        }
        chunk
    }

    fn error_chunk(&mut self, error: ErrorDetail) -> ChatCompletionChunk {
        self.finish_chunk(FinishReason::Error, Some(error))
    }

    fn take_role(&mut self) -> Option<ResponseRole> {
        if self.role_emitted {
            None
        } else {
            self.role_emitted = true;
            Some(ResponseRole::Assistant)
        }
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<CompletionUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cproxy_protocol::claude::stream::{MessageDeltaBody, StreamMessage};
    use cproxy_protocol::claude::{
        MessageType, ResponseRole as ClaudeRole, TextBlock, TextBlockType, ToolUseBlock,
        ToolUseBlockType,
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
                role: ClaudeRole::Assistant,
                stop_reason: None,
                stop_sequence: None,
                r#type: MessageType::Message,
                usage: StreamUsage {
                    input_tokens: Some(9),
                    ..StreamUsage::default()
                },
            },
        })
    }

    fn collect_chunks(outputs: Vec<ChatStreamOutput>) -> Vec<ChatCompletionChunk> {
        outputs
            .into_iter()
            .filter_map(|output| match output {
                ChatStreamOutput::Chunk(chunk) => Some(chunk),
                ChatStreamOutput::Done => None,
            })
            .collect()
    }

    #[test]
    fn text_then_tool_call_stream() {
        let mut state = ChatStreamState::new(0);
        assert!(state.transform_event(start_event()).is_empty());

        let text = state.transform_event(known(StreamEventKnown::ContentBlockStart {
            index: 0,
            content_block: StreamContentBlock::Text(TextBlock {
                text: "Let me check".into(),
                r#type: TextBlockType::Text,
            }),
        }));
        let chunks = collect_chunks(text);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Let me check"));

        // Tool call: nothing is emitted until the block closes.
        assert!(
            state
                .transform_event(known(StreamEventKnown::ContentBlockStart {
                    index: 1,
                    content_block: StreamContentBlock::ToolUse(ToolUseBlock {
                        id: "call_7".into(),
                        input: serde_json::json!({}),
                        name: "get_weather".into(),
                        r#type: ToolUseBlockType::ToolUse,
                    }),
                }))
                .is_empty()
        );
        for piece in ["{\"city\"", ":\"NYC\"}"] {
            assert!(
                state
                    .transform_event(known(StreamEventKnown::ContentBlockDelta {
                        index: 1,
                        delta: ContentBlockDelta::InputJsonDelta {
                            partial_json: piece.into(),
                        },
                    }))
                    .is_empty()
            );
        }
        let stop = collect_chunks(
            state.transform_event(known(StreamEventKnown::ContentBlockStop { index: 1 })),
        );
        let calls = stop[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].id.as_deref(), Some("call_7"));
        let function = calls[0].function.as_ref().unwrap();
        assert_eq!(function.name.as_deref(), Some("get_weather"));
        assert_eq!(function.arguments.as_deref(), Some(r#"{"city":"NYC"}"#));

        state.transform_event(known(StreamEventKnown::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::ToolUse),
                stop_sequence: None,
            },
            usage: StreamUsage {
                output_tokens: Some(12),
                ..StreamUsage::default()
            },
        }));

        let end = state.transform_event(known(StreamEventKnown::MessageStop));
        assert_eq!(end.len(), 2);
        match &end[0] {
            ChatStreamOutput::Chunk(chunk) => {
                assert_eq!(
                    chunk.choices[0].finish_reason,
                    Some(FinishReason::ToolCalls)
                );
                let usage = chunk.usage.as_ref().unwrap();
                assert_eq!(usage.prompt_tokens, 9);
                assert_eq!(usage.completion_tokens, 12);
            }
            other => panic!("unexpected output: {other:?}"),
        }
        assert_eq!(end[1], ChatStreamOutput::Done);
    }

    #[test]
    fn second_tool_call_gets_next_index() {
        let mut state = ChatStreamState::new(0);
        state.transform_event(start_event());
        for (block_index, call_id) in [(0u32, "call_a"), (1u32, "call_b")] {
            state.transform_event(known(StreamEventKnown::ContentBlockStart {
                index: block_index,
                content_block: StreamContentBlock::ToolUse(ToolUseBlock {
                    id: call_id.into(),
                    input: serde_json::json!({}),
                    name: "f".into(),
                    r#type: ToolUseBlockType::ToolUse,
                }),
            }));
        }
        let first = collect_chunks(
            state.transform_event(known(StreamEventKnown::ContentBlockStop { index: 0 })),
        );
        let second = collect_chunks(
            state.transform_event(known(StreamEventKnown::ContentBlockStop { index: 1 })),
        );
        assert_eq!(
            first[0].choices[0].delta.tool_calls.as_ref().unwrap()[0].index,
            0
        );
        assert_eq!(
            second[0].choices[0].delta.tool_calls.as_ref().unwrap()[0].index,
            1
        );
    }

    #[test]
    fn stream_error_renders_inside_stream() {
        let mut state = ChatStreamState::new(0);
        state.transform_event(start_event());
        let outputs = state.transform_event(known(StreamEventKnown::Error {
            error: ErrorDetail {
                r#type: "overloaded_error".into(),
                message: "overloaded".into(),
            },
        }));
        match &outputs[0] {
            ChatStreamOutput::Chunk(chunk) => {
                assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Error));
                assert!(chunk.error.is_some());
            }
            other => panic!("unexpected output: {other:?}"),
        }
        assert_eq!(outputs[1], ChatStreamOutput::Done);
    }

    #[test]
    fn plain_text_stream_finishes_with_stop() {
        let mut state = ChatStreamState::new(0);
        state.transform_event(start_event());
        state.transform_event(known(StreamEventKnown::ContentBlockDelta {
            index: 0,
            delta: ContentBlockDelta::TextDelta { text: "Hi".into() },
        }));
        state.transform_event(known(StreamEventKnown::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: StreamUsage::default(),
        }));
        let end = state.transform_event(known(StreamEventKnown::MessageStop));
        match &end[0] {
            ChatStreamOutput::Chunk(chunk) => {
                assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Stop));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }
}
