use cproxy_protocol::claude::{ContentBlock, Message, StopReason};
use cproxy_protocol::openai::chat::{
    ChatCompletionObjectType, ChatCompletionResponse, Choice, CompletionUsage, FinishReason,
    FunctionCall, ResponseMessage, ResponseRole, ToolCall, ToolCallType,
};

/// Convert a completed upstream message into a Chat-Completions response.
pub fn transform_response(message: Message, created: i64) -> ChatCompletionResponse {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &message.content {
        match block {
            ContentBlock::Text(text) => texts.push(text.text.clone()),
            ContentBlock::ToolUse(tool) => tool_calls.push(ToolCall {
                id: tool.id.clone(),
                r#type: ToolCallType::Function,
                function: FunctionCall {
                    name: tool.name.clone(),
                    arguments: tool.input.to_string(),
                },
            }),
            ContentBlock::Thinking(_) | ContentBlock::Unknown(_) => {}
        }
    }

    let content = if texts.is_empty() {
        None
    } else {
        Some(texts.join(""))
    };
    let finish_reason = map_finish_reason(message.stop_reason, !tool_calls.is_empty());

    ChatCompletionResponse {
        id: message.id,
        object: ChatCompletionObjectType::ChatCompletion,
        created,
        model: message.model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: ResponseRole::Assistant,
                content,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason,
        }],
        usage: Some(CompletionUsage {
            prompt_tokens: message.usage.input_tokens,
            completion_tokens: message.usage.output_tokens,
            total_tokens: message.usage.input_tokens + message.usage.output_tokens,
        }),
    }
}

pub fn map_finish_reason(stop_reason: Option<StopReason>, has_tool_calls: bool) -> FinishReason {
    match stop_reason {
        Some(StopReason::MaxTokens) => FinishReason::Length,
        Some(StopReason::ToolUse) => FinishReason::ToolCalls,
        Some(StopReason::Refusal) => FinishReason::ContentFilter,
        Some(StopReason::EndTurn | StopReason::StopSequence | StopReason::PauseTurn) => {
            FinishReason::Stop
        }
        None if has_tool_calls => FinishReason::ToolCalls,
        None => FinishReason::Stop,
    }
}
