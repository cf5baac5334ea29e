//! Tool-call and structured-output post-processing.
//!
//! Local chat templates emit tool invocations as fenced blocks in the
//! completion text:
//!
//! ```text
//! I'll check the weather.
//! <tool_call>
//! {"name": "get_weather", "arguments": {"location": "Tokyo"}}
//! </tool_call>
//! ```
//!
//! [`parse_tool_calls`] extracts every block, validates the tool name against
//! the request's tool list, and returns structured calls plus any content
//! that preceded the first marker. [`extract_json`] is the best-effort JSON
//! recovery used for `response_format` requests.

use serde_json::Value;
use uuid::Uuid;

use super::types::{ToolCallOut, ToolFunctionOut};

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Result of scanning completion text for tool-call blocks.
#[derive(Debug, Clone, Default)]
pub struct ParsedToolCalls {
    /// Text preceding the first tool-call marker, trimmed.
    pub content: String,
    pub calls: Vec<ToolCallOut>,
}

impl ParsedToolCalls {
    pub fn has_calls(&self) -> bool {
        !self.calls.is_empty()
    }
}

/// Parse every `<tool_call>` block out of `text`.
///
/// Blocks that fail to parse as JSON, lack a `name`, or name a tool absent
/// from `tools` (when a tool list is provided) are dropped with a warning —
/// a malformed call must not fail the whole completion.
pub fn parse_tool_calls(text: &str, tools: Option<&Value>) -> ParsedToolCalls {
    let Some(first_marker) = text.find(TOOL_CALL_OPEN) else {
        return ParsedToolCalls {
            content: text.trim().to_string(),
            calls: Vec::new(),
        };
    };

    let content = text[..first_marker].trim().to_string();
    let known_names = tool_names(tools);
    let mut calls = Vec::new();

    let mut rest = &text[first_marker..];
    while let Some(open) = rest.find(TOOL_CALL_OPEN) {
        let after_open = &rest[open + TOOL_CALL_OPEN.len()..];
        let Some(close) = after_open.find(TOOL_CALL_CLOSE) else {
            tracing::warn!("unterminated tool_call block dropped");
            break;
        };
        let block = after_open[..close].trim();
        rest = &after_open[close + TOOL_CALL_CLOSE.len()..];

        let parsed: Value = match serde_json::from_str(block) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, "tool_call block is not valid JSON — dropped");
                continue;
            }
        };
        let Some(name) = parsed.get("name").and_then(Value::as_str) else {
            tracing::warn!("tool_call block has no name — dropped");
            continue;
        };
        if let Some(known) = &known_names {
            if !known.iter().any(|k| k == name) {
                tracing::warn!(tool = name, "tool_call names unknown tool — dropped");
                continue;
            }
        }

        let arguments = parsed.get("arguments").cloned().unwrap_or(Value::Null);
        let arguments = match arguments {
            // Arguments may themselves arrive as a JSON-encoded string.
            Value::String(s) => serde_json::from_str::<Value>(&s).unwrap_or(Value::String(s)),
            other => other,
        };

        calls.push(ToolCallOut {
            id: format!("call_{}", Uuid::new_v4().simple()),
            call_type: "function".into(),
            function: ToolFunctionOut {
                name: name.to_string(),
                arguments: serde_json::to_string(&arguments)
                    .unwrap_or_else(|_| "{}".to_string()),
            },
        });
    }

    ParsedToolCalls { content, calls }
}

fn tool_names(tools: Option<&Value>) -> Option<Vec<String>> {
    let list = tools?.as_array()?;
    Some(
        list.iter()
            .filter_map(|t| {
                t.pointer("/function/name")
                    .or_else(|| t.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect(),
    )
}

/// Best-effort JSON extraction for structured-output requests.
///
/// Handles models that wrap their JSON in markdown fences or prefix it with
/// prose: strips ```json fences, then falls back to the outermost brace span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    // ```json ... ``` or plain ``` ... ```
    if let Some(fence_start) = trimmed.find("```") {
        let after = &trimmed[fence_start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(fence_end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..fence_end].trim()) {
                return Some(value);
            }
        }
    }

    // Outermost object or array span.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }

    None
}
