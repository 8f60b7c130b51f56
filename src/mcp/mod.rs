//! Tool-server protocol client: JSON-RPC envelopes, the two HTTP transports,
//! per-server sessions and the aggregated tool registry.

pub mod client;
pub mod correlator;
pub mod error;
pub mod jsonrpc;
pub mod registry;
pub mod transport;

pub use client::McpSession;
pub use error::McpError;
pub use registry::{ConnectionStatus, ToolRegistry, ToolWithOrigin};
