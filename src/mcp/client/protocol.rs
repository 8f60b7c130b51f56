use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::transport::McpTransportKind;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    PaginatedRequestParams,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub(crate) fn requested_protocol_version(
    config: &McpServerConfig,
    kind: McpTransportKind,
) -> String {
    config
        .protocol_version
        .as_deref()
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .unwrap_or(kind.default_protocol_version())
        .to_string()
}

pub(crate) fn client_info() -> Implementation {
    Implementation {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        title: None,
        description: None,
        icons: Vec::new(),
        website_url: None,
    }
}

/// Tools are the only capability used, and it is a server capability, so
/// the client advertises none.
pub(crate) fn initialize_params(protocol_version: &str) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: client_info(),
        meta: None,
        protocol_version: protocol_version.to_string(),
    }
}

pub(crate) fn parse_initialize_result(value: Value) -> Result<InitializeResult, McpError> {
    let result: InitializeResult = parse_result(value)?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Decode(
            "initialize result has no protocol version".to_string(),
        ));
    }
    Ok(result)
}

pub(crate) fn list_tools_params(cursor: Option<&str>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor.to_string()),
        meta: None,
    })
}

pub(crate) fn parse_result<T: DeserializeOwned>(value: Value) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(McpError::decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requested_version_prefers_config_override() {
        let mut config = McpServerConfig::new("alpha", "https://example.com/mcp");
        assert_eq!(
            requested_protocol_version(&config, McpTransportKind::StreamableHttp),
            "2025-03-26"
        );
        assert_eq!(
            requested_protocol_version(&config, McpTransportKind::Sse),
            "2024-11-05"
        );

        config.protocol_version = Some(" 2025-06-18 ".to_string());
        assert_eq!(
            requested_protocol_version(&config, McpTransportKind::Sse),
            "2025-06-18"
        );
    }

    #[test]
    fn initialize_params_use_camel_case() {
        let params = serde_json::to_value(initialize_params("2024-11-05")).expect("params");
        assert_eq!(params["protocolVersion"], "2024-11-05");
        assert_eq!(params["clientInfo"]["name"], env!("CARGO_PKG_NAME"));
        assert_eq!(params["clientInfo"]["version"], env!("CARGO_PKG_VERSION"));
        assert!(params["capabilities"].is_object());
    }

    #[test]
    fn initialize_result_requires_protocol_version() {
        let err = parse_initialize_result(json!({
            "protocolVersion": " ",
            "capabilities": {},
            "serverInfo": {"name": "x", "version": "1"}
        }))
        .expect_err("blank version");
        assert!(matches!(err, McpError::Decode(_)));

        let ok = parse_initialize_result(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "serverInfo": {"name": "x", "version": "1"}
        }))
        .expect("minimal result");
        assert!(ok.capabilities.tools.is_none());
        assert_eq!(ok.server_info.name, "x");
    }

    #[test]
    fn list_tools_params_carry_only_a_cursor() {
        assert!(list_tools_params(None).is_none());
        let params = serde_json::to_value(list_tools_params(Some("page-2"))).expect("params");
        assert_eq!(params["cursor"], "page-2");
    }

    #[test]
    fn malformed_result_is_a_decode_error() {
        let err = parse_result::<InitializeResult>(json!({"protocolVersion": 7}))
            .expect_err("wrong shape");
        assert!(matches!(err, McpError::Decode(_)));
    }
}
