pub mod chat_stream;
pub mod config;
pub mod conversation;
pub mod execution;
pub mod message;
pub mod prompt;
pub mod tool_calls;
