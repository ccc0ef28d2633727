use cproxy_protocol::claude::{ContentBlock, Message, StopReason};
use cproxy_protocol::openai::responses::{
    ContentPart, FunctionCallItem, OutputItem, OutputMessageItem, OutputRole, ResponseObjectType,
    ResponseStatus, ResponsesResponse, ResponsesUsage,
};

/// Convert a completed upstream message into a Responses-shape response.
pub fn transform_response(message: Message, created_at: i64) -> ResponsesResponse {
    let mut texts = Vec::new();
    let mut output = Vec::new();

    for block in &message.content {
        match block {
            ContentBlock::Text(text) => texts.push(text.text.clone()),
            ContentBlock::ToolUse(tool) => output.push(OutputItem::FunctionCall(FunctionCallItem {
                id: Some(tool.id.clone()),
                call_id: tool.id.clone(),
                name: tool.name.clone(),
                arguments: tool.input.to_string(),
                status: Some("completed".to_string()),
            })),
            ContentBlock::Thinking(_) | ContentBlock::Unknown(_) => {}
        }
    }

    let status = map_status(message.stop_reason);
    if !texts.is_empty() {
        let content = vec![ContentPart::OutputText {
            text: texts.join(""),
            annotations: Vec::new(),
        }];
        output.insert(
            0,
            OutputItem::Message(OutputMessageItem {
                id: message.id.clone(),
                role: OutputRole::Assistant,
                status,
                content,
            }),
        );
    }

    let output_text = if texts.is_empty() {
        None
    } else {
        Some(texts.join(""))
    };

    ResponsesResponse {
        id: message.id,
        object: ResponseObjectType::Response,
        created_at,
        status,
        model: message.model,
        output,
        output_text,
        usage: Some(ResponsesUsage {
            input_tokens: message.usage.input_tokens,
            output_tokens: message.usage.output_tokens,
            total_tokens: message.usage.input_tokens + message.usage.output_tokens,
        }),
        error: None,
    }
}

pub fn map_status(stop_reason: Option<StopReason>) -> ResponseStatus {
    match stop_reason {
        Some(StopReason::MaxTokens) => ResponseStatus::Incomplete,
        _ => ResponseStatus::Completed,
    }
}
