//! Storage seam between an execution turn and wherever conversations live.

use std::io;

use crate::core::config::data::{Config, McpServerConfig};
use crate::core::message::Message;
use crate::utils::logging::TranscriptWriter;

pub trait ConversationStore {
    /// Servers the next turn may use, in configuration order.
    fn enabled_servers(&self) -> Vec<McpServerConfig>;

    /// Records the final assistant message of a turn.
    fn append_assistant_message(&mut self, message: &Message) -> io::Result<()>;
}

/// Reads servers from the loaded configuration and appends replies to the
/// transcript file, if one is set.
pub struct FileConversationStore {
    servers: Vec<McpServerConfig>,
    transcript: TranscriptWriter,
}

impl FileConversationStore {
    /// `log_file` overrides the configured transcript path.
    pub fn new(config: &Config, log_file: Option<String>) -> io::Result<Self> {
        let mut transcript = TranscriptWriter::new(None);
        if let Some(path) = log_file.or_else(|| config.transcript_file.clone()) {
            transcript.set_log_file(path)?;
        }
        Ok(Self {
            servers: config.enabled_servers(),
            transcript,
        })
    }

    pub fn transcript(&self) -> &TranscriptWriter {
        &self.transcript
    }
}

impl ConversationStore for FileConversationStore {
    fn enabled_servers(&self) -> Vec<McpServerConfig> {
        self.servers.clone()
    }

    fn append_assistant_message(&mut self, message: &Message) -> io::Result<()> {
        if !message.is_assistant() || message.content.trim().is_empty() {
            return Ok(());
        }
        self.transcript.log_message(&message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn only_enabled_servers_are_offered() {
        let mut disabled = McpServerConfig::new("off", "http://localhost:1/mcp");
        disabled.enabled = Some(false);
        let config = Config {
            mcp_servers: vec![McpServerConfig::new("on", "http://localhost:2/mcp"), disabled],
            ..Config::default()
        };

        let store = FileConversationStore::new(&config, None).expect("store");
        let ids: Vec<String> = store
            .enabled_servers()
            .into_iter()
            .map(|server| server.id)
            .collect();
        assert_eq!(ids, vec!["on"]);
        assert!(!store.transcript().is_active());
    }

    #[test]
    fn log_override_wins_and_only_assistant_text_is_written() {
        let dir = tempdir().expect("tempdir");
        let configured = dir.path().join("configured.log");
        let override_path = dir.path().join("override.log");
        let config = Config {
            transcript_file: Some(configured.to_string_lossy().into_owned()),
            ..Config::default()
        };

        let mut store = FileConversationStore::new(
            &config,
            Some(override_path.to_string_lossy().into_owned()),
        )
        .expect("store");
        store
            .append_assistant_message(&Message::user("not logged"))
            .expect("skip");
        store
            .append_assistant_message(&Message::assistant("   "))
            .expect("skip");
        store
            .append_assistant_message(&Message::assistant("The answer is 42."))
            .expect("append");

        assert_eq!(
            std::fs::read_to_string(&override_path).expect("read"),
            "The answer is 42.\n\n"
        );
        assert!(!configured.exists());
    }
}
