//! Glue around the `rust-mcp-schema` wire types.
//!
//! The schema crate models single messages. Servers may also send batches,
//! replies need to be matched by id whether they succeeded or failed, and the
//! model only ever sees tool results as text; those pieces live here.

use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{CallToolResult, ContentBlock, RequestId};
use serde_json::Value;
use tracing::debug;

use super::error::McpError;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const METHOD_NOT_FOUND: i64 = -32601;

pub fn request_message(id: RequestId, request: RequestFromClient) -> Result<ClientMessage, McpError> {
    ClientMessage::from_message(MessageFromClient::RequestFromClient(request), Some(id))
        .map_err(McpError::decode)
}

pub fn initialized_notification() -> Result<ClientMessage, McpError> {
    ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
            None,
        )),
        None,
    )
    .map_err(McpError::decode)
}

/// Parses a payload that may hold a single message or a batch. Entries that
/// are valid JSON but not a recognizable server message are skipped.
pub fn parse_server_messages(payload: &str) -> Result<Vec<ServerMessage>, McpError> {
    let items = match serde_json::from_str::<Value>(payload)? {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<ServerMessage>(item) {
            Ok(message) => messages.push(message),
            Err(err) => debug!(error = %err, "Skipping unrecognized MCP message"),
        }
    }
    Ok(messages)
}

/// Id a reply answers. Requests, notifications and errors the server could
/// not attribute to a request have none.
pub fn reply_id(message: &ServerMessage) -> Option<&RequestId> {
    match message {
        ServerMessage::Response(response) => Some(&response.id),
        ServerMessage::Error(error) => error.id.as_ref(),
        _ => None,
    }
}

pub fn is_reply(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::Response(_) | ServerMessage::Error(_))
}

pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == METHOD_NOT_FOUND
    )
}

/// The `result` of a successful reply, or the JSON-RPC error as
/// [`McpError::Rpc`].
pub fn reply_result(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => Ok(serde_json::to_value(&response.result)?),
        ServerMessage::Error(error) => Err(error.error.into()),
        other => Err(McpError::Decode(format!(
            "unexpected MCP server message: {other:?}"
        ))),
    }
}

pub fn is_error_result(result: &CallToolResult) -> bool {
    result.is_error.unwrap_or(false)
}

/// Flattens a tool result into text for the model: text blocks verbatim,
/// everything else as compact JSON. A result with no content falls back to
/// its structured content.
pub fn render_call_result(result: &CallToolResult) -> String {
    let mut parts: Vec<String> = result
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::TextContent(text) => text.text.clone(),
            other => serde_json::to_string(other)
                .unwrap_or_else(|_| "Unsupported tool content.".to_string()),
        })
        .collect();

    if parts.is_empty() {
        if let Some(structured) = &result.structured_content {
            parts.push(
                serde_json::to_string_pretty(structured)
                    .unwrap_or_else(|_| "Unsupported structured content.".to_string()),
            );
        }
    }

    parts.join("\n")
}
