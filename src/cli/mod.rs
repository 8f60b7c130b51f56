//! Command-line interface parsing and dispatch.

pub mod call;
pub mod chat;
pub mod server_list;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::call::run_call;
use crate::cli::chat::run_chat;
use crate::cli::server_list::{list_servers, list_tools};
use crate::core::config::data::{path_display, Config};
use crate::mcp::registry::ToolRegistry;
use crate::mcp::transport::build_mcp_http_client;
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "toolrelay", version)]
#[command(about = "Let a language model call tools on remote MCP servers")]
#[command(
    long_about = "toolrelay connects to the MCP tool servers listed in its configuration \
file, aggregates their tools, and runs chat turns in which the model may call those tools \
with <tool_call>{...}</tool_call> directives.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    API key when the config file sets none\n\
  OPENAI_BASE_URL   API base URL when the config file sets none\n\
  RUST_LOG          Log filter (overrides --verbose)"
)]
pub struct Args {
    /// Configuration file to use instead of the default location
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Show debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to every configured server and show its status
    Servers,
    /// List the tools exposed by all enabled servers
    Tools,
    /// Invoke one tool and print its result
    Call {
        /// Tool name, optionally qualified as Server.tool
        name: String,
        /// Tool arguments as a JSON object
        #[arg(short = 'a', long, value_name = "JSON")]
        args: Option<String>,
    },
    /// Run one chat turn with tool access
    Chat {
        /// Prompt text (can be multiple words)
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
        /// Append the final reply to this file
        #[arg(short = 'l', long, value_name = "FILE")]
        log: Option<String>,
    },
    /// Inspect the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration file location
    Path,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    if let Commands::Config {
        command: ConfigCommands::Path,
    } = &args.command
    {
        let path = match &args.config {
            Some(path) => path.clone(),
            None => Config::default_config_path()?,
        };
        println!("{}", path_display(path));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;
    match args.command {
        Commands::Servers => {
            let registry = registry_for(&config)?;
            list_servers(&config, &registry).await
        }
        Commands::Tools => {
            let registry = registry_for(&config)?;
            list_tools(&config, &registry).await
        }
        Commands::Call { name, args } => {
            let registry = registry_for(&config)?;
            run_call(&config, &registry, &name, args.as_deref()).await
        }
        Commands::Chat { prompt, log } => {
            let registry = registry_for(&config)?;
            run_chat(&config, &registry, prompt, log).await
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn registry_for(config: &Config) -> Result<ToolRegistry, Box<dyn Error>> {
    let timeouts = config.timeouts.to_mcp_timeouts();
    let client = build_mcp_http_client(&timeouts)?;
    Ok(ToolRegistry::new(client, timeouts))
}
