pub mod data;
pub mod io;

pub use data::{Config, McpServerConfig, ModelConfig, TimeoutConfig};
pub use io::ConfigError;
