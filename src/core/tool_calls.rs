//! Extraction of `<tool_call>{...}</tool_call>` directives from model replies.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct ToolCallWire {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Returns every well-formed directive in `text`, in document order.
/// Malformed directives are skipped.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(TOOL_CALL_OPEN) {
        let body_start = start + TOOL_CALL_OPEN.len();
        let Some(body_len) = rest[body_start..].find(TOOL_CALL_CLOSE) else {
            debug!("Unterminated tool call directive");
            break;
        };
        let body = &rest[body_start..body_start + body_len];
        match parse_tool_call(body) {
            Some(call) => calls.push(call),
            None => debug!(directive = body.trim(), "Skipping malformed tool call"),
        }
        rest = &rest[body_start + body_len + TOOL_CALL_CLOSE.len()..];
    }

    calls
}

fn parse_tool_call(body: &str) -> Option<ToolCall> {
    let wire: ToolCallWire = serde_json::from_str(body.trim()).ok()?;
    let name = wire.name.trim();
    if name.is_empty() {
        return None;
    }

    let arguments = match wire.arguments {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        // Some models encode the arguments object as a JSON string.
        Some(Value::String(encoded)) if encoded.trim().is_empty() => None,
        Some(Value::String(encoded)) => match serde_json::from_str(&encoded).ok()? {
            Value::Object(map) => Some(map),
            _ => return None,
        },
        Some(_) => return None,
    };

    Some(ToolCall {
        name: name.to_string(),
        arguments,
    })
}
