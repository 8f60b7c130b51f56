use crate::mcp::error::McpError;
use crate::mcp::transport::McpTimeouts;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One configured tool server.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct McpServerConfig {
    pub id: String,
    /// Name shown to the model in qualified tool names; the id when empty.
    #[serde(default)]
    pub display_name: String,
    pub base_url: Option<String>,
    /// `streamable-http` (default), `http`, or `sse`.
    pub transport: Option<String>,
    /// Sent as `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub protocol_version: Option<String>,
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn new(id: &str, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            base_url: Some(base_url.to_string()),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Parses the endpoint, rejecting anything that is not an absolute
    /// http(s) URL.
    pub fn endpoint_url(&self) -> Result<reqwest::Url, McpError> {
        let raw = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                McpError::InvalidConfig(format!("server '{}' has no base_url", self.id))
            })?;

        let url = reqwest::Url::parse(raw).map_err(|err| McpError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" if url.host_str().is_some() => Ok(url),
            scheme => Err(McpError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{scheme}'"),
            }),
        }
    }

    /// True when `name` refers to this server by id or display name.
    pub fn matches_name(&self, name: &str) -> bool {
        self.id.eq_ignore_ascii_case(name) || self.display_name.eq_ignore_ascii_case(name)
    }

    pub fn auth_header(&self) -> Option<String> {
        self.auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| format!("Bearer {token}"))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ModelConfig {
    /// OpenAI-compatible API root, e.g. `https://api.openai.com/v1`.
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TimeoutConfig {
    pub call_secs: Option<u64>,
    pub handshake_secs: Option<u64>,
    pub connect_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn to_mcp_timeouts(&self) -> McpTimeouts {
        let defaults = McpTimeouts::default();
        McpTimeouts {
            call: self
                .call_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.call),
            handshake: self
                .handshake_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake),
            connect: self
                .connect_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Append the final assistant message of each turn to this file
    pub transcript_file: Option<String>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl Config {
    /// Enabled servers in configuration order.
    pub fn enabled_servers(&self) -> Vec<McpServerConfig> {
        self.mcp_servers
            .iter()
            .filter(|server| server.is_enabled())
            .cloned()
            .collect()
    }

    pub fn find_server(&self, name: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| server.matches_name(name))
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
