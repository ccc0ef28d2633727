//! Rewrites a native-format request body so the upstream recognises it as
//! first-party CLI traffic: the system-prompt banner, the `mcp_` tool-name
//! prefix, prompt-cache markers, and the reverse prefix strip on the way
//! back out.
//!
//! Every rule is idempotent: applying the decorator twice yields the same
//! bytes as applying it once.

use serde_json::{Map, Value as JsonValue, json};

/// The exact system-prompt prefix the upstream expects from its CLI.
pub const CLI_BANNER: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
pub const TOOL_PREFIX: &str = "mcp_";
pub const PLACEHOLDER_TOOL: &str = "mcp_placeholder";

/// How many trailing messages get an ephemeral cache marker on their last
/// content block.
const CACHE_MESSAGE_COUNT: usize = 3;

/// Which local route the body arrived on; only the native endpoint gets the
/// placeholder tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Messages,
    ChatCompletions,
    Responses,
}

pub fn decorate_request(body: &mut JsonValue, endpoint: Endpoint) {
    prepend_banner(body);
    inject_placeholder_tool(body, endpoint);
    prefix_tools(body);
    prefix_tool_choice(body);
    prefix_tool_use_blocks(body);
    mark_recent_messages(body);
}

fn cache_marker() -> JsonValue {
    json!({"type": "ephemeral"})
}

/// Rule 1: the banner becomes the first system text block, cache-marked.
/// Existing system content is preserved after it.
fn prepend_banner(body: &mut JsonValue) {
    let Some(object) = body.as_object_mut() else {
        return;
    };

    let mut blocks = match object.remove("system") {
        Some(JsonValue::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(JsonValue::Array(blocks)) => blocks,
        Some(other) => vec![other],
        None => Vec::new(),
    };

    let already_first = blocks
        .first()
        .and_then(|block| block.get("text"))
        .and_then(|text| text.as_str())
        .map(|text| text == CLI_BANNER)
        .unwrap_or(false);
    if !already_first {
        blocks.insert(
            0,
            json!({
                "type": "text",
                "text": CLI_BANNER,
                "cache_control": cache_marker(),
            }),
        );
    }

    object.insert("system".to_string(), JsonValue::Array(blocks));
}

/// Rule 2: the native endpoint always carries at least one tool.
fn inject_placeholder_tool(body: &mut JsonValue, endpoint: Endpoint) {
    if endpoint != Endpoint::Messages {
        return;
    }
    let Some(object) = body.as_object_mut() else {
        return;
    };
    let empty = match object.get("tools") {
        Some(JsonValue::Array(tools)) => tools.is_empty(),
        Some(_) => false,
        None => true,
    };
    if empty {
        object.insert(
            "tools".to_string(),
            json!([{
                "name": PLACEHOLDER_TOOL,
                "input_schema": {"type": "object", "properties": {}},
            }]),
        );
    }
}

/// Rule 3: prefix every tool name, force object-typed schemas with an
/// explicit properties field, and cache-mark the last tool only.
fn prefix_tools(body: &mut JsonValue) {
    let Some(tools) = body.get_mut("tools").and_then(|tools| tools.as_array_mut()) else {
        return;
    };
    let last = tools.len().saturating_sub(1);
    for (index, tool) in tools.iter_mut().enumerate() {
        let Some(tool) = tool.as_object_mut() else {
            continue;
        };
        prefix_name(tool);

        let schema = tool
            .entry("input_schema".to_string())
            .or_insert_with(|| json!({}));
        if let Some(schema) = schema.as_object_mut() {
            schema.insert("type".to_string(), json!("object"));
            if !schema.get("properties").map(JsonValue::is_object).unwrap_or(false) {
                schema.insert("properties".to_string(), json!({}));
            }
        }

        if index == last {
            tool.insert("cache_control".to_string(), cache_marker());
        } else {
            tool.remove("cache_control");
        }
    }
}

/// A named tool choice must keep matching its (now prefixed) tool.
fn prefix_tool_choice(body: &mut JsonValue) {
    if let Some(choice) = body
        .get_mut("tool_choice")
        .and_then(|choice| choice.as_object_mut())
    {
        if choice.get("type").and_then(|t| t.as_str()) == Some("tool") {
            prefix_name(choice);
        }
    }
}

/// Rule 4: tool_use blocks inside the conversation get the same prefix.
fn prefix_tool_use_blocks(body: &mut JsonValue) {
    let Some(messages) = body
        .get_mut("messages")
        .and_then(|messages| messages.as_array_mut())
    else {
        return;
    };
    for message in messages {
        let Some(blocks) = message
            .get_mut("content")
            .and_then(|content| content.as_array_mut())
        else {
            continue;
        };
        for block in blocks {
            let Some(block) = block.as_object_mut() else {
                continue;
            };
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                prefix_name(block);
            }
        }
    }
}

fn prefix_name(object: &mut Map<String, JsonValue>) {
    let Some(name) = object.get("name").and_then(|name| name.as_str()) else {
        return;
    };
    if !name.starts_with(TOOL_PREFIX) {
        let prefixed = format!("{TOOL_PREFIX}{name}");
        object.insert("name".to_string(), JsonValue::String(prefixed));
    }
}

/// Rule 5: ephemeral cache markers on the last content block of the last
/// `CACHE_MESSAGE_COUNT` messages. String content is lifted to a single
/// text block first.
fn mark_recent_messages(body: &mut JsonValue) {
    let Some(messages) = body
        .get_mut("messages")
        .and_then(|messages| messages.as_array_mut())
    else {
        return;
    };
    let count = messages.len();
    let from = count.saturating_sub(CACHE_MESSAGE_COUNT);
    for message in &mut messages[from..] {
        let Some(message) = message.as_object_mut() else {
            continue;
        };
        if let Some(JsonValue::String(text)) = message.get("content") {
            let lifted = json!([{"type": "text", "text": text}]);
            message.insert("content".to_string(), lifted);
        }
        if let Some(blocks) = message
            .get_mut("content")
            .and_then(|content| content.as_array_mut())
        {
            if let Some(last) = blocks.last_mut().and_then(|block| block.as_object_mut()) {
                last.insert("cache_control".to_string(), cache_marker());
            }
        }
    }
}

/// Rule 6: on the way out, remove the prefix from every `"name":"mcp_X"`
/// occurrence by textual substitution, so clients see their original tool
/// names. Applied to response bodies and every streamed chunk.
pub fn strip_tool_prefix(payload: &str) -> String {
    payload
        .replace("\"name\":\"mcp_", "\"name\":\"")
        .replace("\"name\": \"mcp_", "\"name\": \"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_body() -> JsonValue {
        json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "system": "Be terse.",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "call_1", "name": "get_weather", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "call_1", "content": "sunny"}
                ]},
                {"role": "user", "content": "two"}
            ],
            "tools": [
                {"name": "get_weather", "input_schema": {"type": "object"}},
                {"name": "mcp_already", "input_schema": {}}
            ]
        })
    }

    #[test]
    fn banner_prepended_with_cache_marker() {
        let mut body = chat_body();
        decorate_request(&mut body, Endpoint::ChatCompletions);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system[0]["text"], CLI_BANNER);
        assert_eq!(system[0]["cache_control"]["type"], "ephemeral");
        assert_eq!(system[1]["text"], "Be terse.");
    }

    #[test]
    fn tool_names_prefixed_and_schema_forced() {
        let mut body = chat_body();
        decorate_request(&mut body, Endpoint::ChatCompletions);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools[0]["name"], "mcp_get_weather");
        assert_eq!(tools[0]["input_schema"]["properties"], json!({}));
        assert_eq!(tools[1]["name"], "mcp_already");
        // Ephemeral marker only on the last tool.
        assert!(tools[0].get("cache_control").is_none());
        assert_eq!(tools[1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn tool_use_blocks_prefixed() {
        let mut body = chat_body();
        decorate_request(&mut body, Endpoint::ChatCompletions);
        assert_eq!(body["messages"][1]["content"][0]["name"], "mcp_get_weather");
    }

    #[test]
    fn last_three_messages_cache_marked() {
        let mut body = chat_body();
        decorate_request(&mut body, Endpoint::ChatCompletions);
        let messages = body["messages"].as_array().unwrap();
        // First message is outside the window and keeps string content.
        assert!(messages[0]["content"].is_string());
        for message in &messages[1..] {
            let blocks = message["content"].as_array().unwrap();
            let last = blocks.last().unwrap();
            assert_eq!(last["cache_control"]["type"], "ephemeral");
        }
    }

    #[test]
    fn placeholder_injected_only_for_native_endpoint() {
        let mut native = json!({"model": "m", "messages": []});
        decorate_request(&mut native, Endpoint::Messages);
        assert_eq!(native["tools"][0]["name"], PLACEHOLDER_TOOL);
        assert_eq!(native["tools"][0]["input_schema"]["properties"], json!({}));

        let mut openai = json!({"model": "m", "messages": []});
        decorate_request(&mut openai, Endpoint::ChatCompletions);
        assert!(openai.get("tools").is_none());
    }

    #[test]
    fn named_tool_choice_tracks_prefixed_tool() {
        let mut body = chat_body();
        body["tool_choice"] = json!({"type": "tool", "name": "get_weather"});
        decorate_request(&mut body, Endpoint::ChatCompletions);
        assert_eq!(body["tool_choice"]["name"], "mcp_get_weather");
        assert_eq!(body["tools"][0]["name"], "mcp_get_weather");
    }

    #[test]
    fn decorator_is_idempotent() {
        for endpoint in [
            Endpoint::Messages,
            Endpoint::ChatCompletions,
            Endpoint::Responses,
        ] {
            let mut once = chat_body();
            decorate_request(&mut once, endpoint);
            let mut twice = once.clone();
            decorate_request(&mut twice, endpoint);
            assert_eq!(
                serde_json::to_vec(&once).unwrap(),
                serde_json::to_vec(&twice).unwrap()
            );
        }
    }

    #[test]
    fn strip_reverses_prefix_on_name_fields() {
        let mut body = chat_body();
        decorate_request(&mut body, Endpoint::ChatCompletions);
        let stripped = strip_tool_prefix(&serde_json::to_string(&body).unwrap());
        let value: JsonValue = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["tools"][0]["name"], "get_weather");
        assert_eq!(value["messages"][1]["content"][0]["name"], "get_weather");
        // Already-prefixed client names lose their prefix too; the rule is
        // textual on purpose.
        assert_eq!(value["tools"][1]["name"], "already");
    }

    #[test]
    fn strip_handles_spaced_json() {
        assert_eq!(
            strip_tool_prefix(r#"{"name": "mcp_lookup"}"#),
            r#"{"name": "lookup"}"#
        );
    }
}
