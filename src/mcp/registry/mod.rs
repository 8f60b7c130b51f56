//! Aggregated tool catalog across every enabled server.
//!
//! The registry owns one [`McpSession`] per server. Refreshes fan out to all
//! servers at once and merge each server's result as soon as it lands, so a
//! slow server never hides the tools of a fast one.

use crate::core::config::data::McpServerConfig;
use crate::mcp::client::McpSession;
use crate::mcp::error::McpError;
use crate::mcp::jsonrpc::{is_error_result, render_call_result};
use crate::mcp::transport::McpTimeouts;
use futures_util::{stream, StreamExt};
use rust_mcp_schema::Tool;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};


/// How long a refreshed catalog is served without reconnecting.
pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Separator between server name and tool name in a qualified name.
pub const QUALIFIED_NAME_SEPARATOR: char = '.';
/// Prefix that marks a tool result the server flagged as an error.
pub const TOOL_ERROR_PREFIX: &str = "Tool error: ";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connecting,
    Connected {
        name: String,
        version: String,
    },
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Unknown => write!(f, "unknown"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected { name, version } => {
                write!(f, "connected ({name} {version})")
            }
            ConnectionStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// A tool together with the server that exposes it.
#[derive(Debug, Clone)]
pub struct ToolWithOrigin {
    pub server_id: String,
    pub server_name: String,
    pub endpoint: String,
    pub tool: Tool,
}

impl ToolWithOrigin {
    /// Identity across servers: `endpoint.tool`.
    pub fn key(&self) -> String {
        format!("{}{}{}", self.endpoint, QUALIFIED_NAME_SEPARATOR, self.tool.name)
    }

    /// Name the model uses to address this tool: `Server.tool`.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}{}{}",
            self.server_name, QUALIFIED_NAME_SEPARATOR, self.tool.name
        )
    }
}

struct ServerEntry {
    config: McpServerConfig,
    status: ConnectionStatus,
    session: Option<Arc<McpSession>>,
    tools: Vec<Tool>,
}

impl ServerEntry {
    fn new(config: McpServerConfig) -> Self {
        Self {
            config,
            status: ConnectionStatus::Unknown,
            session: None,
            tools: Vec::new(),
        }
    }

    fn name(&self) -> &str {
        if self.config.display_name.trim().is_empty() {
            &self.config.id
        } else {
            &self.config.display_name
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Server ids in configuration order.
    order: Vec<String>,
    servers: HashMap<String, ServerEntry>,
    last_refresh: Option<Instant>,
}

impl RegistryState {
    fn entries(&self) -> impl Iterator<Item = &ServerEntry> {
        self.order.iter().filter_map(|id| self.servers.get(id))
    }

    fn aggregate(&self) -> Vec<ToolWithOrigin> {
        self.entries()
            .flat_map(|entry| {
                let endpoint = entry.config.base_url.clone().unwrap_or_default();
                entry.tools.iter().map(move |tool| ToolWithOrigin {
                    server_id: entry.config.id.clone(),
                    server_name: entry.name().to_string(),
                    endpoint: endpoint.clone(),
                    tool: tool.clone(),
                })
            })
            .collect()
    }

    fn has_tools(&self) -> bool {
        self.servers.values().any(|entry| !entry.tools.is_empty())
    }

    /// Resolves `name` to `(server_id, tool_name)`.
    fn resolve(&self, name: &str) -> Option<(String, String)> {
        if let Some((prefix, tool_name)) = name.split_once(QUALIFIED_NAME_SEPARATOR) {
            if let Some(entry) = self
                .entries()
                .find(|entry| entry.config.matches_name(prefix))
            {
                return entry
                    .tools
                    .iter()
                    .any(|tool| tool.name == tool_name)
                    .then(|| (entry.config.id.clone(), tool_name.to_string()));
            }
        }

        // First configured server exposing the bare name wins.
        self.entries()
            .find(|entry| entry.tools.iter().any(|tool| tool.name == name))
            .map(|entry| (entry.config.id.clone(), name.to_string()))
    }

    /// Aligns the server table with `configs`, returning sessions of servers
    /// that were removed or disabled.
    fn sync_configs(&mut self, configs: &[McpServerConfig]) -> Vec<Arc<McpSession>> {
        let mut order = Vec::new();
        let mut enabled = Vec::new();
        for config in configs.iter().filter(|config| config.is_enabled()) {
            if order.contains(&config.id) {
                warn!(server_id = %config.id, "Ignoring duplicate MCP server id");
                continue;
            }
            order.push(config.id.clone());
            enabled.push(config);
        }

        let mut dropped = Vec::new();
        self.servers.retain(|id, entry| {
            if order.contains(id) {
                return true;
            }
            if let Some(session) = entry.session.take() {
                dropped.push(session);
            }
            false
        });

        for config in enabled {
            let Some(entry) = self.servers.get_mut(&config.id) else {
                self.servers
                    .insert(config.id.clone(), ServerEntry::new(config.clone()));
                continue;
            };
            if entry.config != *config {
                // Connection details changed; the next refresh starts over.
                if let Some(session) = entry.session.take() {
                    dropped.push(session);
                }
                entry.config = config.clone();
            }
        }

        self.order = order;
        dropped
    }

    fn record_failure(&mut self, server_id: &str, err: &McpError) -> Option<Arc<McpSession>> {
        let entry = self.servers.get_mut(server_id)?;
        entry.status = ConnectionStatus::Error(err.to_string());
        entry.tools.clear();
        entry.session.take()
    }
}

/// Successful outcome of refreshing one server.
struct ServerRefresh {
    session: Arc<McpSession>,
    name: String,
    version: String,
    tools: Vec<Tool>,
}

struct RegistryInner {
    client: reqwest::Client,
    timeouts: McpTimeouts,
    cache_ttl: Duration,
    state: Mutex<RegistryState>,
    /// Held for the whole of a refresh so refreshes never interleave.
    refresh_lock: tokio::sync::Mutex<()>,
    /// Latest background refresh; a finished handle (even a panicked one)
    /// no longer blocks the next.
    background: Mutex<Option<JoinHandle<()>>>,
    known_configs: Mutex<Vec<McpServerConfig>>,
}

/// Cheap to clone; clones share the same catalog and sessions.
#[derive(Clone)]
pub struct ToolRegistry {
    inner: Arc<RegistryInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ToolRegistry {
    pub fn new(client: reqwest::Client, timeouts: McpTimeouts) -> Self {
        Self::with_cache_ttl(client, timeouts, TOOL_CACHE_TTL)
    }

    pub fn with_cache_ttl(
        client: reqwest::Client,
        timeouts: McpTimeouts,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                client,
                timeouts,
                cache_ttl,
                state: Mutex::new(RegistryState::default()),
                refresh_lock: tokio::sync::Mutex::new(()),
                background: Mutex::new(None),
                known_configs: Mutex::new(Vec::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        lock(&self.inner.state)
    }

    /// Connects to every enabled server concurrently and replaces each
    /// server's tools with what it reports. Failures are recorded per server
    /// and never abort the others.
    pub async fn refresh(&self, configs: &[McpServerConfig]) {
        let _guard = self.inner.refresh_lock.lock().await;
        *lock(&self.inner.known_configs) = configs.to_vec();

        let (targets, dropped) = {
            let mut state = self.state();
            let dropped = state.sync_configs(configs);
            let mut targets = Vec::new();
            for id in state.order.clone() {
                let Some(entry) = state.servers.get_mut(&id) else {
                    continue;
                };
                match entry.config.endpoint_url() {
                    Ok(_) => {
                        entry.status = ConnectionStatus::Connecting;
                        targets.push((entry.config.clone(), entry.session.clone()));
                    }
                    Err(err) => {
                        warn!(server_id = %id, error = %err, "Skipping MCP server with invalid endpoint");
                        entry.status = ConnectionStatus::Error(err.to_string());
                        entry.tools.clear();
                    }
                }
            }
            (targets, dropped)
        };

        for session in dropped {
            session.close().await;
        }

        let concurrency = targets.len().max(1);
        let mut outcomes = stream::iter(targets)
            .map(|(config, session)| {
                let client = self.inner.client.clone();
                let timeouts = self.inner.timeouts;
                async move {
                    let outcome = refresh_server(&config, session, client, timeouts).await;
                    (config.id, outcome)
                }
            })
            .buffer_unordered(concurrency);

        while let Some((server_id, outcome)) = outcomes.next().await {
            self.merge(&server_id, outcome).await;
        }

        self.state().last_refresh = Some(Instant::now());
    }

    async fn merge(&self, server_id: &str, outcome: Result<ServerRefresh, McpError>) {
        let evicted = {
            let mut state = self.state();
            match outcome {
                Ok(refresh) => match state.servers.get_mut(server_id) {
                    Some(entry) => {
                        info!(server_id, tools = refresh.tools.len(), "MCP server refreshed");
                        entry.status = ConnectionStatus::Connected {
                            name: refresh.name,
                            version: refresh.version,
                        };
                        entry.tools = refresh.tools;
                        entry.session = Some(refresh.session);
                        None
                    }
                    None => Some(refresh.session),
                },
                Err(err) => {
                    warn!(server_id, error = %err, "MCP server refresh failed");
                    state.record_failure(server_id, &err)
                }
            }
        };
        if let Some(session) = evicted {
            session.close().await;
        }
    }

    /// Current aggregate, in configuration order.
    pub fn tools(&self) -> Vec<ToolWithOrigin> {
        self.state().aggregate()
    }

    pub fn statuses(&self) -> Vec<(String, ConnectionStatus)> {
        self.state()
            .entries()
            .map(|entry| (entry.config.id.clone(), entry.status.clone()))
            .collect()
    }

    pub fn status(&self, server_id: &str) -> ConnectionStatus {
        self.state()
            .servers
            .get(server_id)
            .map(|entry| entry.status.clone())
            .unwrap_or_default()
    }

    /// True while the last refresh is within the cache window and produced
    /// at least one tool.
    pub fn is_fresh(&self) -> bool {
        let state = self.state();
        state
            .last_refresh
            .is_some_and(|at| at.elapsed() < self.inner.cache_ttl)
            && state.has_tools()
    }

    /// Returns the cached catalog. A stale or empty cache starts a
    /// background refresh; the caller gets whatever is cached right now.
    pub fn tools_for_prompt(&self, configs: &[McpServerConfig]) -> Vec<ToolWithOrigin> {
        if !self.is_fresh() {
            self.spawn_refresh(configs.to_vec());
        }
        self.tools()
    }

    fn spawn_refresh(&self, configs: Vec<McpServerConfig>) {
        let mut background = lock(&self.inner.background);
        if background
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!("MCP refresh already running");
            return;
        }
        let registry = self.clone();
        *background = Some(tokio::spawn(async move {
            registry.refresh(&configs).await;
        }));
    }

    /// Waits for a background refresh started by
    /// [`ToolRegistry::tools_for_prompt`], if any.
    pub async fn wait_for_refresh(&self) {
        let handle = lock(&self.inner.background).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "Background MCP refresh did not complete");
            }
        }
    }

    /// Resolves `name` against the current catalog. `Server.tool` is looked
    /// up only on the named server; anything else is matched as a bare tool
    /// name against every server in configuration order.
    pub fn resolve(&self, name: &str) -> Option<ToolWithOrigin> {
        let state = self.state();
        let (server_id, tool_name) = state.resolve(name)?;
        state
            .aggregate()
            .into_iter()
            .find(|tool| tool.server_id == server_id && tool.tool.name == tool_name)
    }

    /// Invokes a tool and renders its result as text. Results the server
    /// flags as errors come back prefixed with [`TOOL_ERROR_PREFIX`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        configs: &[McpServerConfig],
    ) -> Result<String, McpError> {
        let has_tools = self.state().has_tools();
        if !has_tools {
            self.refresh(configs).await;
        }

        let (server_id, tool_name, session) = {
            let state = self.state();
            let (server_id, tool_name) = state
                .resolve(name)
                .ok_or_else(|| McpError::UnknownTool(name.to_string()))?;
            let session = state
                .servers
                .get(&server_id)
                .and_then(|entry| entry.session.clone())
                .ok_or(McpError::NotInitialized)?;
            (server_id, tool_name, session)
        };

        debug!(server_id = %server_id, tool = %tool_name, "Calling MCP tool");
        match session.call_tool(&tool_name, arguments).await {
            Ok(result) => {
                let text = render_call_result(&result);
                if is_error_result(&result) {
                    Ok(format!("{TOOL_ERROR_PREFIX}{text}"))
                } else {
                    Ok(text)
                }
            }
            Err(err) => {
                if err.is_connection_failure() {
                    let evicted = self.state().record_failure(&server_id, &err);
                    if let Some(session) = evicted {
                        session.close().await;
                    }
                }
                Err(err)
            }
        }
    }

    /// Server configurations passed to the most recent refresh.
    pub fn known_configs(&self) -> Vec<McpServerConfig> {
        lock(&self.inner.known_configs).clone()
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<McpSession>> = self
            .state()
            .servers
            .values_mut()
            .filter_map(|entry| entry.session.take())
            .collect();
        for session in sessions {
            session.close().await;
        }
    }
}

/// Connects (or reuses a ready session) and fetches the tool list.
async fn refresh_server(
    config: &McpServerConfig,
    existing: Option<Arc<McpSession>>,
    client: reqwest::Client,
    timeouts: McpTimeouts,
) -> Result<ServerRefresh, McpError> {
    let session = match existing.filter(|session| session.is_ready()) {
        Some(session) => session,
        None => {
            debug!(server_id = %config.id, "Opening MCP session");
            Arc::new(McpSession::from_config(config, client, timeouts)?)
        }
    };

    match fetch_catalog(&session).await {
        Ok((name, version, tools)) => Ok(ServerRefresh {
            session,
            name,
            version,
            tools,
        }),
        Err(err) => {
            session.close().await;
            Err(err)
        }
    }
}

async fn fetch_catalog(session: &McpSession) -> Result<(String, String, Vec<Tool>), McpError> {
    let initialize = session.initialize().await?;
    let tools = session.list_tools().await?;
    Ok((
        initialize.server_info.name,
        initialize.server_info.version,
        tools,
    ))
}
