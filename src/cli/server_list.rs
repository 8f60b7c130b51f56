use std::error::Error;

use crate::core::config::data::Config;
use crate::mcp::registry::{ConnectionStatus, ToolRegistry, ToolWithOrigin};

pub async fn list_servers(config: &Config, registry: &ToolRegistry) -> Result<(), Box<dyn Error>> {
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    registry.refresh(&config.enabled_servers()).await;
    print!("{}", format_server_table(config, &registry.statuses()));
    registry.shutdown().await;
    Ok(())
}

pub async fn list_tools(config: &Config, registry: &ToolRegistry) -> Result<(), Box<dyn Error>> {
    registry.refresh(&config.enabled_servers()).await;
    let tools = registry.tools();
    if tools.is_empty() {
        println!("No tools available.");
    } else {
        print!("{}", format_tool_list(&tools));
    }

    for (server_id, status) in registry.statuses() {
        if let ConnectionStatus::Error(message) = status {
            eprintln!("⚠️  {server_id}: {message}");
        }
    }
    registry.shutdown().await;
    Ok(())
}

/// One line per configured server: id, display name, transport, status.
pub fn format_server_table(config: &Config, statuses: &[(String, ConnectionStatus)]) -> String {
    let mut table = String::new();
    for server in &config.mcp_servers {
        let status = if server.is_enabled() {
            statuses
                .iter()
                .find(|(id, _)| id == &server.id)
                .map(|(_, status)| status.to_string())
                .unwrap_or_else(|| ConnectionStatus::Unknown.to_string())
        } else {
            "disabled".to_string()
        };
        let transport = server.transport.as_deref().unwrap_or("streamable-http");
        table.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            server.id, server.display_name, transport, status
        ));
    }
    table
}

pub fn format_tool_list(tools: &[ToolWithOrigin]) -> String {
    let mut list = String::new();
    for tool in tools {
        list.push_str(&tool.qualified_name());
        if let Some(description) = tool.tool.description.as_deref() {
            let first_line = description.lines().next().unwrap_or_default().trim();
            if !first_line.is_empty() {
                list.push_str(" - ");
                list.push_str(first_line);
            }
        }
        list.push('\n');
    }
    list
}
