//! The protocol-independent conversation model every inbound shape reduces
//! to before it is serialised for the upstream.
//!
//! The normalisation pass enforces the pairing rules the upstream requires:
//! a tool-calling assistant turn is always followed by exactly one
//! tool-results turn carrying the same call-id set.

use serde_json::Value as JsonValue;
use tracing::warn;

use cproxy_protocol::claude::{
    ContentBlockParam, ImageBlockParam, ImageBlockType, ImageSource, MessageContent, MessageParam,
    MessageRole, SystemParam, TextBlockParam, ToolResultBlockParam, ToolResultBlockType,
    ToolResultContent, ToolUseBlockParam, ToolUseBlockType,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultEntry {
    pub call_id: String,
    pub name: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UserPart {
    Text(String),
    Image { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    System(String),
    User(Vec<UserPart>),
    Assistant {
        text: Vec<String>,
        tool_calls: Vec<ToolCall>,
    },
    ToolResults(Vec<ToolResultEntry>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Repair ordering and pairing so the turn sequence satisfies the
    /// upstream's constraints:
    /// - consecutive user turns merge into one;
    /// - every tool-calling assistant turn is immediately followed by a
    ///   tool-results turn with the same call-id set (results are lifted
    ///   forward out of wherever they currently sit; a result that exists
    ///   nowhere is synthesised empty);
    /// - whitespace-only text is dropped, and turns left empty disappear.
    pub fn normalize(&mut self) {
        self.drop_blank_text();
        self.pair_tool_results();
        self.merge_user_turns();
    }

    fn drop_blank_text(&mut self) {
        for turn in &mut self.turns {
            match turn {
                Turn::User(parts) => {
                    parts.retain(|part| match part {
                        UserPart::Text(text) => !text.trim().is_empty(),
                        UserPart::Image { .. } => true,
                    });
                }
                Turn::Assistant { text, .. } => {
                    text.retain(|t| !t.trim().is_empty());
                }
                Turn::System(_) | Turn::ToolResults(_) => {}
            }
        }
        self.turns.retain(|turn| match turn {
            Turn::System(text) => !text.trim().is_empty(),
            Turn::User(parts) => !parts.is_empty(),
            Turn::Assistant { text, tool_calls } => !text.is_empty() || !tool_calls.is_empty(),
            Turn::ToolResults(results) => !results.is_empty(),
        });
    }

    fn pair_tool_results(&mut self) {
        let mut index = 0;
        while index < self.turns.len() {
            let call_ids: Vec<(String, String)> = match &self.turns[index] {
                Turn::Assistant { tool_calls, .. } if !tool_calls.is_empty() => tool_calls
                    .iter()
                    .map(|call| (call.call_id.clone(), call.name.clone()))
                    .collect(),
                _ => {
                    index += 1;
                    continue;
                }
            };

            let mut results = Vec::new();
            for (call_id, name) in &call_ids {
                match self.lift_result(index + 1, call_id) {
                    Some(result) => results.push(result),
                    None => {
                        warn!(call_id = %call_id, tool = %name, "no result for tool call; synthesising empty output");
                        results.push(ToolResultEntry {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            output: String::new(),
                        });
                    }
                }
            }

            // Lifting may have emptied a following results turn already
            // sitting where the new one goes.
            if matches!(self.turns.get(index + 1), Some(Turn::ToolResults(r)) if r.is_empty()) {
                self.turns.remove(index + 1);
            }
            self.turns.insert(index + 1, Turn::ToolResults(results));
            index += 2;
        }

        self.turns.retain(|turn| match turn {
            Turn::ToolResults(results) => !results.is_empty(),
            _ => true,
        });
    }

    /// Remove and return the result for `call_id` from any tool-results turn
    /// at or after `from`.
    fn lift_result(&mut self, from: usize, call_id: &str) -> Option<ToolResultEntry> {
        for turn in self.turns.iter_mut().skip(from) {
            if let Turn::ToolResults(results) = turn {
                if let Some(pos) = results.iter().position(|r| r.call_id == call_id) {
                    return Some(results.remove(pos));
                }
            }
        }
        None
    }

    fn merge_user_turns(&mut self) {
        let mut merged: Vec<Turn> = Vec::with_capacity(self.turns.len());
        for turn in self.turns.drain(..) {
            match (merged.last_mut(), turn) {
                (Some(Turn::User(previous)), Turn::User(parts)) => {
                    previous.extend(parts);
                }
                (_, turn) => merged.push(turn),
            }
        }
        self.turns = merged;
    }

    /// Serialise to the upstream shape: system fragments join into one
    /// system field; the remaining turns become user/assistant messages.
    pub fn into_claude(self) -> (Option<SystemParam>, Vec<MessageParam>) {
        let mut system_texts = Vec::new();
        let mut messages = Vec::new();

        for turn in self.turns {
            match turn {
                Turn::System(text) => system_texts.push(text),
                Turn::User(parts) => messages.push(user_message(parts)),
                Turn::Assistant { text, tool_calls } => {
                    messages.push(assistant_message(text, tool_calls));
                }
                Turn::ToolResults(results) => messages.push(tool_results_message(results)),
            }
        }

        let system = if system_texts.is_empty() {
            None
        } else {
            Some(SystemParam::Text(system_texts.join("\n")))
        };
        (system, messages)
    }
}

fn user_message(parts: Vec<UserPart>) -> MessageParam {
    let blocks: Vec<ContentBlockParam> = parts
        .into_iter()
        .map(|part| match part {
            UserPart::Text(text) => ContentBlockParam::Text(TextBlockParam::new(text)),
            UserPart::Image { url } => ContentBlockParam::Image(ImageBlockParam {
                source: image_source(url),
                r#type: ImageBlockType::Image,
                cache_control: None,
            }),
        })
        .collect();

    MessageParam {
        role: MessageRole::User,
        content: collapse_single_text(blocks),
    }
}

fn image_source(url: String) -> ImageSource {
    if let Some((media_type, data)) = parse_data_url(&url) {
        ImageSource::Base64 { data, media_type }
    } else {
        ImageSource::Url { url }
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn assistant_message(text: Vec<String>, tool_calls: Vec<ToolCall>) -> MessageParam {
    let mut blocks: Vec<ContentBlockParam> = text
        .into_iter()
        .map(|t| ContentBlockParam::Text(TextBlockParam::new(t)))
        .collect();

    for call in tool_calls {
        blocks.push(ContentBlockParam::ToolUse(ToolUseBlockParam {
            id: call.call_id,
            input: ensure_object(call.arguments),
            name: call.name,
            r#type: ToolUseBlockType::ToolUse,
            cache_control: None,
        }));
    }

    MessageParam {
        role: MessageRole::Assistant,
        content: collapse_single_text(blocks),
    }
}

fn tool_results_message(results: Vec<ToolResultEntry>) -> MessageParam {
    let blocks: Vec<ContentBlockParam> = results
        .into_iter()
        .map(|result| {
            ContentBlockParam::ToolResult(ToolResultBlockParam {
                tool_use_id: result.call_id,
                r#type: ToolResultBlockType::ToolResult,
                content: Some(ToolResultContent::Text(result.output)),
                is_error: None,
                cache_control: None,
            })
        })
        .collect();

    MessageParam {
        role: MessageRole::User,
        content: MessageContent::Blocks(blocks),
    }
}

fn collapse_single_text(blocks: Vec<ContentBlockParam>) -> MessageContent {
    if blocks.len() == 1 {
        if let ContentBlockParam::Text(text) = &blocks[0] {
            return MessageContent::Text(text.text.clone());
        }
    }
    MessageContent::Blocks(blocks)
}

/// Tool-use input must be an object on the wire; anything else is wrapped.
pub fn ensure_object(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(_) => value,
        JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("arguments".to_string(), other);
            JsonValue::Object(map)
        }
    }
}

/// Parse a JSON-encoded argument string; non-JSON input becomes a wrapped
/// string rather than an error.
pub fn parse_arguments(arguments: &str) -> JsonValue {
    if arguments.trim().is_empty() {
        return JsonValue::Object(serde_json::Map::new());
    }
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(value) => ensure_object(value),
        Err(_) => ensure_object(JsonValue::String(arguments.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            call_id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({}),
        }
    }

    fn result(id: &str, name: &str, output: &str) -> ToolResultEntry {
        ToolResultEntry {
            call_id: id.to_string(),
            name: name.to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn tool_calls_pair_with_following_results() {
        let mut conversation = Conversation::default();
        conversation.push(Turn::Assistant {
            text: vec![],
            tool_calls: vec![call("a", "f"), call("b", "g")],
        });
        conversation.push(Turn::ToolResults(vec![
            result("a", "f", "1"),
            result("b", "g", "2"),
        ]));
        conversation.normalize();

        match &conversation.turns[..] {
            [Turn::Assistant { tool_calls, .. }, Turn::ToolResults(results)] => {
                let calls: Vec<&str> = tool_calls.iter().map(|c| c.call_id.as_str()).collect();
                let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
                assert_eq!(calls, ids);
            }
            other => panic!("unexpected turns: {other:?}"),
        }
    }

    #[test]
    fn distant_results_are_lifted_next_to_their_calls() {
        let mut conversation = Conversation::default();
        conversation.push(Turn::Assistant {
            text: vec![],
            tool_calls: vec![call("a", "f")],
        });
        conversation.push(Turn::Assistant {
            text: vec!["thinking out loud".to_string()],
            tool_calls: vec![],
        });
        conversation.push(Turn::ToolResults(vec![result("a", "f", "42")]));
        conversation.normalize();

        assert!(
            matches!(&conversation.turns[1], Turn::ToolResults(results) if results[0].output == "42")
        );
        assert_eq!(conversation.turns.len(), 3);
    }

    #[test]
    fn missing_result_is_synthesised_empty() {
        let mut conversation = Conversation::default();
        conversation.push(Turn::Assistant {
            text: vec![],
            tool_calls: vec![call("a", "f")],
        });
        conversation.normalize();

        match &conversation.turns[..] {
            [Turn::Assistant { .. }, Turn::ToolResults(results)] => {
                assert_eq!(results[0].call_id, "a");
                assert_eq!(results[0].output, "");
            }
            other => panic!("unexpected turns: {other:?}"),
        }
    }

    #[test]
    fn consecutive_user_turns_merge() {
        let mut conversation = Conversation::default();
        conversation.push(Turn::User(vec![UserPart::Text("one".into())]));
        conversation.push(Turn::User(vec![UserPart::Text("two".into())]));
        conversation.normalize();
        assert_eq!(conversation.turns.len(), 1);
    }

    #[test]
    fn whitespace_only_text_is_dropped() {
        let mut conversation = Conversation::default();
        conversation.push(Turn::User(vec![UserPart::Text("  \n ".into())]));
        conversation.push(Turn::Assistant {
            text: vec!["\t".into(), "real".into()],
            tool_calls: vec![],
        });
        conversation.normalize();
        assert_eq!(conversation.turns.len(), 1);
        assert!(
            matches!(&conversation.turns[0], Turn::Assistant { text, .. } if text == &["real".to_string()])
        );
    }

    #[test]
    fn into_claude_renders_tool_pairing() {
        let mut conversation = Conversation::default();
        conversation.push(Turn::System("stay factual".into()));
        conversation.push(Turn::User(vec![UserPart::Text("weather?".into())]));
        conversation.push(Turn::Assistant {
            text: vec![],
            tool_calls: vec![ToolCall {
                call_id: "call_7".into(),
                name: "get_weather".into(),
                arguments: serde_json::json!({"city": "NYC"}),
            }],
        });
        conversation.push(Turn::ToolResults(vec![result(
            "call_7",
            "get_weather",
            "sunny",
        )]));
        conversation.normalize();
        let (system, messages) = conversation.into_claude();

        assert!(matches!(system, Some(SystemParam::Text(ref t)) if t == "stay factual"));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        match &messages[2].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlockParam::ToolResult(block) => {
                    assert_eq!(block.tool_use_id, "call_7");
                }
                other => panic!("unexpected block: {other:?}"),
            },
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn parse_arguments_tolerates_non_json() {
        assert_eq!(parse_arguments("{\"a\":1}"), serde_json::json!({"a": 1}));
        assert_eq!(parse_arguments(""), serde_json::json!({}));
        assert_eq!(
            parse_arguments("not json"),
            serde_json::json!({"arguments": "not json"})
        );
    }
}
