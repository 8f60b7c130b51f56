//! One execution turn: ask the model, run the tools it asks for, feed the
//! results back, and repeat until it answers without tool calls.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::chat_stream::{collect_reply, ModelClient, ModelError};
use crate::core::message::Message;
use crate::core::tool_calls::{extract_tool_calls, ToolCall};
use crate::mcp::error::McpError;
use crate::mcp::registry::ToolRegistry;

/// Tool rounds allowed in one turn. The model is asked once more after the
/// last round, but any directives in that final reply are not executed.
pub const MAX_TOOL_DEPTH: usize = 5;

/// Something that can run a named tool and render its result as text.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<String, McpError>;
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn invoke(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<String, McpError> {
        let configs = self.known_configs();
        self.call_tool(name, arguments, &configs).await
    }
}

pub struct ExecutionLoop<'a> {
    model: &'a dyn ModelClient,
    tools: &'a dyn ToolInvoker,
    max_depth: usize,
}

impl<'a> ExecutionLoop<'a> {
    pub fn new(model: &'a dyn ModelClient, tools: &'a dyn ToolInvoker) -> Self {
        Self {
            model,
            tools,
            max_depth: MAX_TOOL_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Runs the turn and returns the history with every assistant reply and
    /// tool-result message appended. Tool failures become result text; only
    /// model failures end the turn early.
    pub async fn run(&self, mut history: Vec<Message>) -> Result<Vec<Message>, ModelError> {
        let mut depth = 0;
        loop {
            let reply = collect_reply(self.model, &history).await?;
            let calls = extract_tool_calls(&reply);
            history.push(Message::assistant(reply));

            if calls.is_empty() {
                debug!(depth, "Turn finished without tool calls");
                return Ok(history);
            }
            if depth >= self.max_depth {
                warn!(depth, pending = calls.len(), "Tool depth limit reached; ignoring further tool calls");
                return Ok(history);
            }

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.execute(call).await);
            }
            history.push(Message::user(results.join("\n\n")));
            depth += 1;
        }
    }

    async fn execute(&self, call: ToolCall) -> String {
        info!(tool = %call.name, "Running tool");
        match self.tools.invoke(&call.name, call.arguments).await {
            Ok(output) => format_tool_result(&call.name, &output),
            Err(err) => {
                warn!(tool = %call.name, error = %err, "Tool call failed");
                format_tool_result(&call.name, &format!("Error calling tool {}: {err}", call.name))
            }
        }
    }
}

fn format_tool_result(name: &str, output: &str) -> String {
    format!("<tool_result name=\"{name}\">\n{output}\n</tool_result>")
}
