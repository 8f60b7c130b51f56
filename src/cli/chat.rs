//! One-shot chat turn with tool access.

use std::error::Error;

use tracing::info;

use crate::core::chat_stream::OpenAiCompatibleClient;
use crate::core::config::data::Config;
use crate::core::conversation::{ConversationStore, FileConversationStore};
use crate::core::execution::ExecutionLoop;
use crate::core::message::{Message, Role};
use crate::core::prompt::build_system_prompt;
use crate::mcp::registry::ToolRegistry;

pub async fn run_chat(
    config: &Config,
    registry: &ToolRegistry,
    prompt: Vec<String>,
    log_file: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("Usage: toolrelay chat <prompt>");
        std::process::exit(1);
    }

    let mut store = FileConversationStore::new(config, log_file)?;
    let servers = store.enabled_servers();

    let mut tools = registry.tools_for_prompt(&servers);
    if tools.is_empty() && !servers.is_empty() {
        // Nothing cached yet; a one-shot turn waits for the first catalog.
        registry.wait_for_refresh().await;
        tools = registry.tools();
    }
    info!(tools = tools.len(), "Starting chat turn");

    let history = vec![
        Message::system(build_system_prompt(&tools)),
        Message::user(prompt),
    ];
    let initial_len = history.len();

    let model = OpenAiCompatibleClient::from_config(&config.model, reqwest::Client::new());
    let outcome = ExecutionLoop::new(&model, registry).run(history).await;
    registry.shutdown().await;
    let history = outcome?;

    for message in &history[initial_len..] {
        match message.role {
            Role::Assistant => println!("{}\n", message.content),
            _ => eprintln!("{}\n", message.content),
        }
    }

    if let Some(last) = history.last().filter(|message| message.is_assistant()) {
        store.append_assistant_message(last)?;
    }
    Ok(())
}
