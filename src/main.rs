use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use patchloop::services::ProjectServices;

mod cli;
mod command;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let root = cli::resolve_workspace_root(cli.workspace_root.clone())?;
    let config = cli.core_config()?;
    let services = ProjectServices::open(root, config)?;

    // If --mcp flag is set, run as MCP server
    if cli.mcp {
        return patchloop::mcp::run_mcp_server(services).await;
    }

    match cli.command.take() {
        Some(Commands::Run {
            task,
            conversation_id,
        }) => {
            command::run_task(services, &cli, task, conversation_id).await?;
        }
        Some(Commands::Patches { action }) => {
            command::run_patches(services, action).await?;
        }
        Some(Commands::Checkpoints { action }) => {
            command::run_checkpoints(services, action).await?;
        }
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!("Use 'patchloop run <task>' to start an agent run or 'patchloop --mcp' to start the MCP server.");
        }
    }

    Ok(())
}
