use std::collections::HashMap;

use cproxy_protocol::claude::{
    CreateMessageRequestBody, Metadata, Tool, ToolInputSchema, ToolInputSchemaType,
};
use cproxy_protocol::openai::chat::{
    ChatCompletionRequest, ChatMessage, StopConfig, ToolChoiceMode, ToolChoiceOption,
    ToolDefinition, UserContent, UserContentPart,
};
use serde_json::Value as JsonValue;

use crate::conversation::{Conversation, ToolCall, ToolResultEntry, Turn, UserPart};
use crate::tool_choice::{self, ChoiceKind};

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Convert a Chat-Completions request into an upstream create-message body.
/// `model` is the already-mapped upstream model id.
pub fn transform_request(request: ChatCompletionRequest, model: String) -> CreateMessageRequestBody {
    let conversation = to_conversation(&request.messages);
    let (system, messages) = conversation.into_claude();

    let tools = map_tools(request.tools);
    let tool_choice = tool_choice::resolve(
        request.tool_choice.map(map_choice),
        tools.as_deref(),
        request.parallel_tool_calls,
    );

    CreateMessageRequestBody {
        max_tokens: map_max_tokens(request.max_completion_tokens.or(request.max_tokens)),
        messages,
        model,
        metadata: request.user.map(|user_id| Metadata {
            user_id: Some(user_id),
        }),
        stop_sequences: map_stop(request.stop),
        stream: request.stream,
        system,
        temperature: request.temperature.map(|value| value.clamp(0.0, 1.0)),
        tool_choice,
        tools,
        top_k: None,
        top_p: request.top_p,
    }
}

/// Reduce the flat role-tagged list to canonical turns. Two passes: the
/// first collects every tool_call id → name mapping from assistant
/// messages, the second emits turns, merging consecutive tool-role
/// messages into a single results turn.
pub fn to_conversation(messages: &[ChatMessage]) -> Conversation {
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in messages {
        if let ChatMessage::Assistant {
            tool_calls: Some(calls),
            ..
        } = message
        {
            for call in calls {
                call_names.insert(call.id.clone(), call.function.name.clone());
            }
        }
    }

    let mut conversation = Conversation::default();
    for message in messages {
        match message {
            ChatMessage::System { content } | ChatMessage::Developer { content } => {
                conversation.push(Turn::System(content.joined()));
            }
            ChatMessage::User { content } => {
                conversation.push(Turn::User(map_user_content(content)));
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let text = content
                    .as_ref()
                    .map(|content| vec![content.joined()])
                    .unwrap_or_default();
                let tool_calls = tool_calls
                    .as_ref()
                    .map(|calls| {
                        calls
                            .iter()
                            .map(|call| ToolCall {
                                call_id: call.id.clone(),
                                name: call.function.name.clone(),
                                arguments: crate::conversation::parse_arguments(
                                    &call.function.arguments,
                                ),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                conversation.push(Turn::Assistant { text, tool_calls });
            }
            ChatMessage::Tool {
                content,
                tool_call_id,
            } => {
                let entry = ToolResultEntry {
                    call_id: tool_call_id.clone(),
                    name: call_names.get(tool_call_id).cloned().unwrap_or_default(),
                    output: content.joined(),
                };
                // Consecutive tool messages must land in one results turn.
                match conversation.turns.last_mut() {
                    Some(Turn::ToolResults(results)) => results.push(entry),
                    _ => conversation.push(Turn::ToolResults(vec![entry])),
                }
            }
        }
    }

    conversation.normalize();
    conversation
}

fn map_user_content(content: &UserContent) -> Vec<UserPart> {
    match content {
        UserContent::Text(text) => vec![UserPart::Text(text.clone())],
        UserContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                UserContentPart::Text { text } => UserPart::Text(text.clone()),
                UserContentPart::ImageUrl { image_url } => UserPart::Image {
                    url: image_url.url.clone(),
                },
            })
            .collect(),
    }
}

fn map_tools(tools: Option<Vec<ToolDefinition>>) -> Option<Vec<Tool>> {
    let tools: Vec<Tool> = tools?
        .into_iter()
        .map(|ToolDefinition::Function { function }| Tool {
            name: function.name,
            description: function.description,
            input_schema: map_input_schema(function.parameters),
            cache_control: None,
        })
        .collect();
    if tools.is_empty() { None } else { Some(tools) }
}

fn map_input_schema(parameters: Option<JsonValue>) -> ToolInputSchema {
    let Some(JsonValue::Object(object)) = parameters else {
        return ToolInputSchema::empty();
    };

    let properties = object
        .get("properties")
        .cloned()
        .unwrap_or_else(|| JsonValue::Object(serde_json::Map::new()));
    let required = object.get("required").and_then(|value| {
        value.as_array().map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
    });

    ToolInputSchema {
        r#type: ToolInputSchemaType::Object,
        properties,
        required,
    }
}

fn map_choice(choice: ToolChoiceOption) -> ChoiceKind {
    match choice {
        ToolChoiceOption::Mode(ToolChoiceMode::None) => ChoiceKind::None,
        ToolChoiceOption::Mode(ToolChoiceMode::Auto) => ChoiceKind::Auto,
        ToolChoiceOption::Mode(ToolChoiceMode::Required) => ChoiceKind::Required,
        ToolChoiceOption::Named(named) => match (named.r#type.as_str(), named.function) {
            ("function", Some(function)) => match function.name {
                Some(name) => ChoiceKind::Named(name),
                None => ChoiceKind::Required,
            },
            // `{type: function}` without a name and `{type: any}` both mean
            // "some tool must be called".
            _ => ChoiceKind::Required,
        },
    }
}

fn map_stop(stop: Option<StopConfig>) -> Option<Vec<String>> {
    let sequences: Vec<String> = match stop? {
        StopConfig::Single(value) => vec![value],
        StopConfig::Many(values) => values,
    }
    .into_iter()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
    .collect();
    if sequences.is_empty() {
        None
    } else {
        Some(sequences)
    }
}

fn map_max_tokens(value: Option<i64>) -> u32 {
    match value {
        Some(value) if value > 0 => value.min(u32::MAX as i64) as u32,
        _ => DEFAULT_MAX_TOKENS,
    }
}
