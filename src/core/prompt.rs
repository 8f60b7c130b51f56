//! System prompt that teaches the model the `<tool_call>` convention and
//! lists the tools it may call.

use crate::core::tool_calls::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN};
use crate::mcp::registry::ToolWithOrigin;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;

const BASE_PROMPT: &str = "You are a helpful assistant.";

pub fn build_system_prompt(tools: &[ToolWithOrigin]) -> String {
    if tools.is_empty() {
        return BASE_PROMPT.to_string();
    }

    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str(
        "\n\nYou can call external tools. To call a tool, reply with a directive of the form\n",
    );
    let _ = writeln!(
        prompt,
        "{TOOL_CALL_OPEN}{{\"name\": \"Server.tool\", \"arguments\": {{...}}}}{TOOL_CALL_CLOSE}"
    );
    prompt.push_str(
        "You may emit several directives in one reply; they run in order. \
         Tool results arrive in the next user message. \
         When you have what you need, answer without any directive.\n\nAvailable tools:\n",
    );

    for tool in tools {
        let _ = write!(prompt, "- {}", tool.qualified_name());
        if let Some(description) = tool
            .tool
            .description
            .as_deref()
            .map(str::trim)
            .filter(|description| !description.is_empty())
        {
            let _ = write!(prompt, ": {description}");
        }
        prompt.push('\n');

        let schema = &tool.tool.input_schema;
        let properties: BTreeMap<_, _> = schema.properties.iter().flatten().collect();
        for (name, property) in properties {
            let required = if schema.required.contains(name) {
                ", required"
            } else {
                ""
            };
            let _ = write!(prompt, "    - {name} ({}{required})", property_type(property));
            if let Some(description) = property.get("description").and_then(Value::as_str) {
                let _ = write!(prompt, ": {description}");
            }
            prompt.push('\n');
        }
    }

    prompt
}

/// JSON Schema `type` of a property: `string`, `string | null`, or `any`.
fn property_type(property: &Map<String, Value>) -> String {
    match property.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(Value::Array(kinds)) => {
            let kinds: Vec<&str> = kinds.iter().filter_map(Value::as_str).collect();
            if kinds.is_empty() {
                "any".to_string()
            } else {
                kinds.join(" | ")
            }
        }
        _ => "any".to_string(),
    }
}
