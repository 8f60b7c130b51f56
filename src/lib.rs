//! toolrelay lets a language model call tools hosted on remote MCP servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] speaks the tool-server protocol: JSON-RPC envelopes, the
//!   streamable-HTTP and legacy SSE transports, per-server sessions, and the
//!   [`mcp::ToolRegistry`] that aggregates every server's tools.
//! - [`core`] runs execution turns: it extracts `<tool_call>` directives from
//!   model replies, invokes the tools, and feeds results back to the model.
//!   It also owns configuration and the model client.
//! - [`api`] defines the chat-completions payloads sent to model servers.
//! - [`cli`] is the command-line front end used by the `toolrelay` binary.

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
