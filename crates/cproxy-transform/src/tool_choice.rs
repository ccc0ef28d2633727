//! Tool-choice translation shared by both OpenAI-shaped endpoints.

use tracing::warn;

use cproxy_protocol::claude::{Tool, ToolChoice};

/// The protocol-independent reading of a client tool choice.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceKind {
    None,
    Auto,
    Required,
    Named(String),
}

/// Apply the shared downgrade rules and produce the upstream choice:
/// a named tool not present in the tool list downgrades to `auto`; any
/// choice other than `none` is dropped when no tools are supplied.
pub fn resolve(
    choice: Option<ChoiceKind>,
    tools: Option<&[Tool]>,
    parallel_tool_calls: Option<bool>,
) -> Option<ToolChoice> {
    let choice = choice?;
    let disable_parallel_tool_use = parallel_tool_calls.map(|value| !value);

    let has_tools = tools.map(|tools| !tools.is_empty()).unwrap_or(false);
    if !has_tools && choice != ChoiceKind::None {
        return None;
    }

    let choice = match choice {
        ChoiceKind::Named(name) => {
            let known = tools
                .map(|tools| tools.iter().any(|tool| tool.name == name))
                .unwrap_or(false);
            if known {
                ChoiceKind::Named(name)
            } else {
                warn!(tool = %name, "tool_choice names an unknown tool; downgrading to auto");
                ChoiceKind::Auto
            }
        }
        other => other,
    };

    Some(match choice {
        ChoiceKind::None => ToolChoice::None,
        ChoiceKind::Auto => ToolChoice::Auto {
            disable_parallel_tool_use,
        },
        ChoiceKind::Required => ToolChoice::Any {
            disable_parallel_tool_use,
        },
        ChoiceKind::Named(name) => ToolChoice::Tool {
            name,
            disable_parallel_tool_use,
        },
    })
}
