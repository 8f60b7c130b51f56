//! Protocol session for one configured tool server.
//!
//! A session owns its transport and walks `uninitialized -> initializing ->
//! ready`. Only a ready session lists or calls tools.

use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::jsonrpc::{
    initialized_notification, is_method_not_found, reply_result, request_message,
};
use crate::mcp::transport::{build_transport, McpTimeouts, McpTransport, McpTransportKind};
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, Implementation, InitializeResult, ListToolsResult,
    RequestId, Tool,
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub(crate) mod protocol;


/// Upper bound on tools accepted from one server across all pages.
pub const MCP_MAX_TOOL_LIST: usize = 100;

#[derive(Debug, Clone)]
enum SessionState {
    Uninitialized,
    Initializing,
    Ready(Box<InitializeResult>),
}

pub struct McpSession {
    server_id: String,
    protocol_version: String,
    transport: Box<dyn McpTransport>,
    timeouts: McpTimeouts,
    next_request_id: AtomicI64,
    state: Mutex<SessionState>,
}

impl McpSession {
    /// Builds an uninitialized session for `config` over the transport it
    /// names.
    pub fn from_config(
        config: &McpServerConfig,
        client: reqwest::Client,
        timeouts: McpTimeouts,
    ) -> Result<Self, McpError> {
        let kind = McpTransportKind::from_config(config)?;
        let transport = build_transport(config, client, timeouts)?;
        Ok(Self::with_transport(
            config.id.clone(),
            protocol::requested_protocol_version(config, kind),
            transport,
            timeouts,
        ))
    }

    pub fn with_transport(
        server_id: String,
        protocol_version: String,
        transport: Box<dyn McpTransport>,
        timeouts: McpTimeouts,
    ) -> Self {
        Self {
            server_id,
            protocol_version,
            transport,
            timeouts,
            next_request_id: AtomicI64::new(0),
            state: Mutex::new(SessionState::Uninitialized),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state(), SessionState::Ready(_))
    }

    pub fn server_info(&self) -> Option<Implementation> {
        match &*self.state() {
            SessionState::Ready(result) => Some(result.server_info.clone()),
            _ => None,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Runs the handshake. Calling it on a ready session returns the stored
    /// result without touching the network.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        {
            let mut state = self.state();
            match &*state {
                SessionState::Ready(result) => return Ok((**result).clone()),
                // A concurrent handshake has not finished yet.
                SessionState::Initializing => return Err(McpError::NotInitialized),
                SessionState::Uninitialized => {}
            }
            *state = SessionState::Initializing;
        }

        match self.handshake().await {
            Ok(result) => {
                *self.state() = SessionState::Ready(Box::new(result.clone()));
                Ok(result)
            }
            Err(err) => {
                *self.state() = SessionState::Uninitialized;
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        self.transport.connect().await?;

        let params = protocol::initialize_params(&self.protocol_version);
        let reply = self
            .send(RequestFromClient::InitializeRequest(params))
            .await?;
        let result = protocol::parse_initialize_result(reply_result(reply)?)?;
        self.transport.set_protocol_version(&result.protocol_version);

        info!(
            server_id = %self.server_id,
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol_version = %result.protocol_version,
            "MCP session initialized"
        );

        let notified = match initialized_notification() {
            Ok(message) => self.transport.send_notification(message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = notified {
            warn!(server_id = %self.server_id, error = %err, "Failed to send initialized notification");
        }
        Ok(result)
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }

    /// Sends `request` under a fresh id and returns the reply, which may be
    /// a JSON-RPC error.
    async fn send(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        let id = self.next_id();
        debug!(server_id = %self.server_id, request_id = ?id, "MCP request");
        let message = request_message(id.clone(), request)?;
        self.transport
            .send_request(id, message, self.timeouts.call)
            .await
    }

    /// Fetches every page of `tools/list`, stopping at [`MCP_MAX_TOOL_LIST`].
    /// A server without the method exposes no tools.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.ensure_ready()?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        loop {
            let reply = self
                .send(RequestFromClient::ListToolsRequest(
                    protocol::list_tools_params(cursor.as_deref()),
                ))
                .await?;
            if is_method_not_found(&reply) {
                debug!(server_id = %self.server_id, "MCP server does not list tools");
                break;
            }

            let page: ListToolsResult = protocol::parse_result(reply_result(reply)?)?;
            tools.extend(page.tools);
            if tools.len() >= MCP_MAX_TOOL_LIST {
                tools.truncate(MCP_MAX_TOOL_LIST);
                break;
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() && seen_cursors.insert(next.clone()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        debug!(server_id = %self.server_id, count = tools.len(), "MCP tools listed");
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_ready()?;
        let mut params = CallToolRequestParams::new(name);
        if let Some(arguments) = arguments {
            params = params.with_arguments(arguments);
        }
        let reply = self
            .send(RequestFromClient::CallToolRequest(params))
            .await?;
        protocol::parse_result(reply_result(reply)?)
    }

    pub async fn close(&self) {
        self.transport.close().await;
        *self.state() = SessionState::Uninitialized;
    }
}
