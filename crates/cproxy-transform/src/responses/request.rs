//! Responses-shape requests reduce to canonical turns through an
//! order-repairing walk.
//!
//! Clients running tool-calling loops emit `message`, `function_call`, and
//! `function_call_output` items in wire orders that do not directly satisfy
//! the upstream's call/result pairing rules, so a field-by-field mapping is
//! not enough. The walk below re-derives the intended turn structure:
//! calls are grouped into runs, their results are found wherever they lie,
//! and an assistant message adopts only those calls whose results fall
//! inside its own batching window.

use std::collections::{HashMap, HashSet};

use cproxy_protocol::claude::{CreateMessageRequestBody, Metadata, Tool, ToolInputSchema,
    ToolInputSchemaType};
use cproxy_protocol::openai::responses::{
    ContentPart, InputItem, InputParam, ItemContent, ItemRole, MessageItem, ResponsesRequest,
    ResponsesTool, ToolChoiceMode, ToolChoiceParam,
};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::conversation::{self, Conversation, ToolCall, ToolResultEntry, Turn, UserPart};
use crate::tool_choice::{self, ChoiceKind};

const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Convert a Responses request into an upstream create-message body.
/// `model` is the already-mapped upstream model id.
pub fn transform_request(request: ResponsesRequest, model: String) -> CreateMessageRequestBody {
    let mut conversation = match request.input {
        Some(InputParam::Text(text)) => {
            let mut conversation = Conversation::default();
            conversation.push(Turn::User(vec![UserPart::Text(text)]));
            conversation
        }
        Some(InputParam::Items(items)) => conversation_from_items(&items),
        None => Conversation::default(),
    };

    if let Some(instructions) = request.instructions {
        conversation.turns.insert(0, Turn::System(instructions));
    }
    let (system, messages) = conversation.into_claude();

    let tools = map_tools(request.tools);
    let tool_choice = tool_choice::resolve(
        request.tool_choice.map(map_choice),
        tools.as_deref(),
        request.parallel_tool_calls,
    );

    CreateMessageRequestBody {
        max_tokens: map_max_tokens(request.max_output_tokens),
        messages,
        model,
        metadata: request.user.map(|user_id| Metadata {
            user_id: Some(user_id),
        }),
        stop_sequences: None,
        stream: request.stream,
        system,
        temperature: request.temperature.map(|value| value.clamp(0.0, 1.0)),
        tool_choice,
        tools,
        top_k: None,
        top_p: request.top_p,
    }
}

/// Walk the heterogeneous item list and emit canonical turns.
pub fn conversation_from_items(items: &[InputItem]) -> Conversation {
    // First pass: every call's name and every output, wherever they sit.
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut outputs: HashMap<&str, (usize, String)> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        match item {
            InputItem::FunctionCall(call) => {
                call_names.insert(call.call_id.as_str(), call.name.as_str());
            }
            InputItem::FunctionCallOutput(output) => {
                outputs.insert(
                    output.call_id.as_str(),
                    (index, item_content_text(&output.output)),
                );
            }
            _ => {}
        }
    }

    let mut conversation = Conversation::default();
    let mut consumed_calls: HashSet<&str> = HashSet::new();
    let mut consumed_outputs: HashSet<&str> = HashSet::new();

    for (index, item) in items.iter().enumerate() {
        match item {
            InputItem::Message(message) => match message.role {
                ItemRole::System | ItemRole::Developer => {
                    conversation.push(Turn::System(item_content_text(&message.content)));
                }
                ItemRole::User => {
                    conversation.push(Turn::User(user_parts(&message.content)));
                }
                ItemRole::Assistant => {
                    emit_assistant_message(
                        items,
                        index,
                        message,
                        &outputs,
                        &mut consumed_calls,
                        &mut consumed_outputs,
                        &mut conversation,
                    );
                }
            },
            InputItem::FunctionCall(call) => {
                if consumed_calls.contains(call.call_id.as_str()) {
                    continue;
                }
                // A bare call outside any assistant message's orbit: gather
                // the run of immediately-following bare calls into one turn.
                let mut run = Vec::new();
                for later in &items[index..] {
                    match later {
                        InputItem::FunctionCall(call)
                            if !consumed_calls.contains(call.call_id.as_str()) =>
                        {
                            consumed_calls.insert(call.call_id.as_str());
                            run.push(ToolCall {
                                call_id: call.call_id.clone(),
                                name: call.name.clone(),
                                arguments: conversation::parse_arguments(&call.arguments),
                            });
                        }
                        InputItem::Message(_) | InputItem::FunctionCallOutput(_) => break,
                        _ => {}
                    }
                }
                let results = collect_anywhere(&run, &outputs, &mut consumed_outputs);
                conversation.push(Turn::Assistant {
                    text: Vec::new(),
                    tool_calls: run,
                });
                if !results.is_empty() {
                    conversation.push(Turn::ToolResults(results));
                }
            }
            InputItem::FunctionCallOutput(output) => {
                if !consumed_outputs.contains(output.call_id.as_str())
                    && !call_names.contains_key(output.call_id.as_str())
                {
                    warn!(call_id = %output.call_id, "function_call_output without a matching call; dropping");
                }
            }
            InputItem::Other(value) => {
                warn!(item = %item_type(value), "ignoring unsupported input item");
            }
        }
    }

    conversation.normalize();
    conversation
}

/// Assistant message handling: adopt orphan calls seen earlier, then the
/// calls of this message's batching window whose outputs fall inside it.
#[allow(clippy::too_many_arguments)]
fn emit_assistant_message<'a>(
    items: &'a [InputItem],
    index: usize,
    message: &MessageItem,
    outputs: &HashMap<&'a str, (usize, String)>,
    consumed_calls: &mut HashSet<&'a str>,
    consumed_outputs: &mut HashSet<&'a str>,
    conversation: &mut Conversation,
) {
    // Orphan calls before this message become their own prior turn, with
    // results pulled from anywhere in the input.
    let mut orphans = Vec::new();
    for earlier in &items[..index] {
        if let InputItem::FunctionCall(call) = earlier {
            if consumed_calls.insert(call.call_id.as_str()) {
                orphans.push(ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: conversation::parse_arguments(&call.arguments),
                });
            }
        }
    }
    if !orphans.is_empty() {
        let results = collect_anywhere(&orphans, outputs, consumed_outputs);
        conversation.push(Turn::Assistant {
            text: Vec::new(),
            tool_calls: orphans,
        });
        if !results.is_empty() {
            conversation.push(Turn::ToolResults(results));
        }
    }

    // The batching window runs from this message to the next message item.
    let window_end = items[index + 1..]
        .iter()
        .position(|item| matches!(item, InputItem::Message(_)))
        .map(|offset| index + 1 + offset)
        .unwrap_or(items.len());

    let mut window_calls = Vec::new();
    for item in &items[index + 1..window_end] {
        if let InputItem::FunctionCall(call) = item {
            if consumed_calls.contains(call.call_id.as_str()) {
                continue;
            }
            let output_in_window = outputs
                .get(call.call_id.as_str())
                .map(|(output_index, _)| (index..window_end).contains(output_index))
                .unwrap_or(false);
            if output_in_window {
                consumed_calls.insert(call.call_id.as_str());
                window_calls.push(ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: conversation::parse_arguments(&call.arguments),
                });
            }
            // Calls without an in-window output stay put and are emitted as
            // a separate later turn by the bare-call rule.
        }
    }

    let results = collect_anywhere(&window_calls, outputs, consumed_outputs);
    conversation.push(Turn::Assistant {
        text: assistant_text(&message.content),
        tool_calls: window_calls,
    });
    if !results.is_empty() {
        conversation.push(Turn::ToolResults(results));
    }
}

/// Pull the matching output for each call from wherever it sits in the
/// input, marking it consumed.
fn collect_anywhere<'a>(
    calls: &[ToolCall],
    outputs: &HashMap<&'a str, (usize, String)>,
    consumed_outputs: &mut HashSet<&'a str>,
) -> Vec<ToolResultEntry> {
    let mut results = Vec::new();
    for call in calls {
        if let Some((key, (_, output))) = outputs.get_key_value(call.call_id.as_str()) {
            consumed_outputs.insert(key);
            results.push(ToolResultEntry {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                output: output.clone(),
            });
        }
    }
    results
}

fn item_content_text(content: &ItemContent) -> String {
    match content {
        ItemContent::Text(text) => text.clone(),
        ItemContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::InputText { text } => Some(text.clone()),
                ContentPart::OutputText { text, .. } => Some(text.clone()),
                ContentPart::Refusal { refusal } => Some(refusal.clone()),
                ContentPart::InputImage { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn user_parts(content: &ItemContent) -> Vec<UserPart> {
    match content {
        ItemContent::Text(text) => vec![UserPart::Text(text.clone())],
        ItemContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::InputText { text } | ContentPart::OutputText { text, .. } => {
                    Some(UserPart::Text(text.clone()))
                }
                ContentPart::Refusal { refusal } => Some(UserPart::Text(refusal.clone())),
                ContentPart::InputImage { image_url, .. } => image_url
                    .as_ref()
                    .map(|url| UserPart::Image { url: url.clone() }),
            })
            .collect(),
    }
}

fn assistant_text(content: &ItemContent) -> Vec<String> {
    let text = item_content_text(content);
    if text.is_empty() { Vec::new() } else { vec![text] }
}

fn item_type(value: &JsonValue) -> &str {
    value
        .get("type")
        .and_then(|value| value.as_str())
        .unwrap_or("unknown")
}

fn map_tools(tools: Option<Vec<ResponsesTool>>) -> Option<Vec<Tool>> {
    let tools: Vec<Tool> = tools?
        .into_iter()
        .map(|tool| match tool {
            ResponsesTool::Function {
                name,
                description,
                parameters,
                strict: _,
            } => Tool {
                name,
                description,
                input_schema: map_input_schema(parameters),
                cache_control: None,
            },
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

fn map_choice(choice: ToolChoiceParam) -> ChoiceKind {
    match choice {
        ToolChoiceParam::Mode(ToolChoiceMode::None) => ChoiceKind::None,
        ToolChoiceParam::Mode(ToolChoiceMode::Auto) => ChoiceKind::Auto,
        ToolChoiceParam::Mode(ToolChoiceMode::Required) => ChoiceKind::Required,
        ToolChoiceParam::Named(named) => match named.name {
            Some(name) => ChoiceKind::Named(name),
            None => ChoiceKind::Required,
        },
    }
}

fn map_max_tokens(value: Option<i64>) -> u32 {
    match value {
        Some(value) if value > 0 => value.min(u32::MAX as i64) as u32,
        _ => DEFAULT_MAX_TOKENS,
    }
}
