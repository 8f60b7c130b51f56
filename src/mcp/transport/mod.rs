//! Shared MCP transport abstractions.
//!
//! Both transports move JSON-RPC envelopes for one configured server; they
//! differ only in where replies arrive. The session picks one at construction
//! time and never inspects it again.

use crate::core::config::data::McpServerConfig;
use crate::mcp::correlator::ResponseCorrelator;
use crate::mcp::error::McpError;
use crate::mcp::jsonrpc::{is_reply, parse_server_messages, reply_id};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use rust_mcp_schema::RequestId;
use std::time::Duration;
use tracing::{debug, warn};

pub mod event_stream;
pub mod http;
pub mod sse;

pub use http::StreamableHttpTransport;
pub use sse::SseTransport;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_EVENT_STREAM_ACCEPT: &str = "text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Protocol revision requested over streamable HTTP unless the server config
/// overrides it.
pub const STREAMABLE_HTTP_PROTOCOL_VERSION: &str = "2025-03-26";
/// The HTTP+SSE transport was retired after this revision.
pub const SSE_PROTOCOL_VERSION: &str = "2024-11-05";

const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::StreamableHttp`] answers each POST directly, or with
///   `202 Accepted` and a later event on the GET stream.
/// - [`McpTransportKind::Sse`] is the legacy HTTP+SSE pairing where every
///   reply arrives on the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    StreamableHttp,
    Sse,
}

impl McpTransportKind {
    /// Resolves transport type from config, defaulting to streamable HTTP.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = config
            .transport
            .as_deref()
            .map(str::trim)
            .unwrap_or("streamable-http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "" | "streamable-http" | "streamable_http" | "http" => {
                Ok(McpTransportKind::StreamableHttp)
            }
            "sse" => Ok(McpTransportKind::Sse),
            other => Err(McpError::InvalidConfig(format!(
                "unsupported MCP transport: {other}"
            ))),
        }
    }

    pub fn default_protocol_version(self) -> &'static str {
        match self {
            McpTransportKind::StreamableHttp => STREAMABLE_HTTP_PROTOCOL_VERSION,
            McpTransportKind::Sse => SSE_PROTOCOL_VERSION,
        }
    }
}

/// Per-exchange deadlines shared by every server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpTimeouts {
    /// Request/response exchange, including a deferred reply.
    pub call: Duration,
    /// Opening the subscription and waiting for the `endpoint` event.
    pub handshake: Duration,
    /// TCP connect.
    pub connect: Duration,
}

impl Default for McpTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(30),
            handshake: Duration::from_secs(60),
            connect: Duration::from_secs(10),
        }
    }
}

/// Transport contract used by [`crate::mcp::client::McpSession`].
///
/// Methods take `&self` so one session can carry several outstanding
/// requests; implementations keep their mutable state behind locks.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establishes long-lived state before the handshake. For the legacy
    /// transport this opens the subscription and waits for the endpoint.
    async fn connect(&self) -> Result<(), McpError>;

    /// Sends one request carrying `id` and waits up to `timeout` for the
    /// reply (a result or a JSON-RPC error) with the same id.
    async fn send_request(
        &self,
        id: RequestId,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError>;

    async fn send_notification(&self, message: ClientMessage) -> Result<(), McpError>;

    /// Records the version negotiated during `initialize`.
    fn set_protocol_version(&self, _protocol_version: &str) {}

    /// Stops background readers and releases pending waiters.
    async fn close(&self);
}

/// Builds the transport selected by `config`.
pub fn build_transport(
    config: &McpServerConfig,
    client: reqwest::Client,
    timeouts: McpTimeouts,
) -> Result<Box<dyn McpTransport>, McpError> {
    let endpoint = config.endpoint_url()?;
    let headers = ServerHeaders::from_config(config);
    match McpTransportKind::from_config(config)? {
        McpTransportKind::StreamableHttp => Ok(Box::new(StreamableHttpTransport::new(
            config.id.clone(),
            endpoint,
            client,
            headers,
        ))),
        McpTransportKind::Sse => Ok(Box::new(SseTransport::new(
            config.id.clone(),
            endpoint,
            client,
            headers,
            timeouts.handshake,
        ))),
    }
}

/// Builds the HTTP client shared by every MCP transport.
///
/// No overall request timeout is set because the subscription GET stays open
/// for the life of the session. Exchanges are bounded with
/// `tokio::time::timeout`.
pub fn build_mcp_http_client(timeouts: &McpTimeouts) -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(McpError::transport)
}

/// Authorization and custom headers attached to every request for a server.
#[derive(Debug, Clone, Default)]
pub struct ServerHeaders {
    authorization: Option<String>,
    extra: Vec<(String, String)>,
}

impl ServerHeaders {
    pub fn from_config(config: &McpServerConfig) -> Self {
        let mut extra: Vec<(String, String)> = config
            .headers
            .iter()
            .flatten()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        extra.sort();
        Self {
            authorization: config.auth_header(),
            extra,
        }
    }

    pub fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.extra {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, auth.as_str());
        }
        request
    }
}

pub fn apply_json_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header(reqwest::header::CONTENT_TYPE, MCP_JSON_CONTENT_TYPE)
        .header(reqwest::header::ACCEPT, MCP_JSON_AND_SSE_ACCEPT)
}

pub fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

pub(crate) fn content_type_of(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Fails with [`McpError::BadStatus`] unless the status is 2xx.
pub(crate) fn ensure_success(response: &reqwest::Response) -> Result<(), McpError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(McpError::BadStatus {
            status: status.as_u16(),
        })
    }
}

/// Routes every reply in an event payload to the correlator. Requests and
/// notifications pushed by the server are logged and dropped.
pub(crate) fn route_messages(server_id: &str, payload: &str, correlator: &ResponseCorrelator) {
    let messages = match parse_server_messages(payload) {
        Ok(messages) => messages,
        Err(err) => {
            warn!(server_id, error = %err, "Dropping malformed MCP event");
            return;
        }
    };

    for message in messages {
        if !is_reply(&message) {
            debug!(server_id, "Ignoring MCP server request or notification");
            continue;
        }
        match reply_id(&message).cloned() {
            Some(id) => {
                if !correlator.deliver(id.clone(), message) {
                    debug!(server_id, request_id = ?id, "MCP reply was not claimed");
                }
            }
            None => warn!(server_id, "Dropping MCP error without request id"),
        }
    }
}
