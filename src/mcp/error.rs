//! Error taxonomy for tool-server connections.

use std::time::Duration;

use rust_mcp_schema::RpcError;
use serde_json::Value;

/// Failures surfaced by transports, sessions and the tool registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    /// The server configuration cannot be used (missing URL, unknown transport).
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),
    /// The endpoint does not parse to an absolute http(s) URL.
    #[error("invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Connecting, sending or reading failed below the protocol layer.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server answered with a non-success HTTP status.
    #[error("HTTP error: {status}")]
    BadStatus { status: u16 },
    /// A payload could not be decoded.
    #[error("decode failure: {0}")]
    Decode(String),
    /// A well-formed reply carried a JSON-RPC error object.
    #[error("MCP error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// A request was issued before the handshake completed.
    #[error("MCP session not initialized")]
    NotInitialized,
    /// No reply arrived within the allotted time.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The subscription never produced an `endpoint` event.
    #[error("server never announced a message endpoint: {0}")]
    EndpointNotAnnounced(String),
    /// The subscription ended while requests were still outstanding.
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl McpError {
    /// True for failures that leave the underlying connection unusable; the
    /// registry drops the session so the next refresh reconnects from scratch.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_)
                | McpError::BadStatus { .. }
                | McpError::Timeout(_)
                | McpError::EndpointNotAnnounced(_)
                | McpError::SubscriptionClosed(_)
                | McpError::NotInitialized
        )
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        McpError::Transport(err.to_string())
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        McpError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return McpError::BadStatus {
                status: status.as_u16(),
            };
        }
        if err.is_decode() {
            return McpError::Decode(err.to_string());
        }
        McpError::Transport(err.to_string())
    }
}

impl From<RpcError> for McpError {
    fn from(error: RpcError) -> Self {
        McpError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Decode(err.to_string())
    }
}
