use std::error::Error;

use serde_json::{Map, Value};

use crate::core::config::data::Config;
use crate::mcp::registry::ToolRegistry;

pub async fn run_call(
    config: &Config,
    registry: &ToolRegistry,
    name: &str,
    raw_arguments: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let arguments = parse_arguments(raw_arguments)?;
    let servers = config.enabled_servers();

    registry.refresh(&servers).await;
    let result = registry.call_tool(name, arguments, &servers).await;
    registry.shutdown().await;

    println!("{}", result?);
    Ok(())
}

/// Parses `--args`; anything other than a JSON object is rejected.
pub fn parse_arguments(raw: Option<&str>) -> Result<Option<Map<String, Value>>, String> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(err) => Err(format!("invalid tool arguments: {err}")),
    }
}
