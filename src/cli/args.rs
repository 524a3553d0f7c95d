use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use patchloop::config::CoreConfig;
use patchloop::orchestrator::ollama::{DEFAULT_MODEL, DEFAULT_OLLAMA_URL};
use patchloop::tools::Mode;

/// Patchloop - agent execution core with staged patch sets and checkpoints
#[derive(Parser)]
#[command(name = "patchloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run as MCP server over stdio
    #[arg(long)]
    pub mcp: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace root (auto-detects git root if absent)
    #[arg(short = 'w', long, global = true)]
    pub workspace_root: Option<String>,

    /// Ollama model used by `run`
    #[arg(short = 'm', long, env = "PATCHLOOP_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Ollama base URL
    #[arg(long, env = "PATCHLOOP_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,

    /// Default mode for mutating tools: apply or propose
    #[arg(long)]
    pub mode: Option<Mode>,

    /// Model calls allowed before the verify phase
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Verify rounds allowed after the primary work (0 disables verify)
    #[arg(long)]
    pub max_verify_iterations: Option<usize>,

    /// Command prefix allowed in the verify phase (repeatable, replaces the defaults)
    #[arg(long = "verify-allow", value_name = "PREFIX")]
    pub verify_allow: Vec<String>,

    /// Shell command timeout in seconds
    #[arg(long)]
    pub shell_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Environment configuration with command-line overrides applied.
    pub fn core_config(&self) -> Result<CoreConfig> {
        let mut config = CoreConfig::from_env()?;
        if let Some(mode) = self.mode {
            config.default_mode = mode;
        }
        if let Some(n) = self.max_iterations {
            config.max_iterations = n;
        }
        if let Some(n) = self.max_verify_iterations {
            config.max_verify_iterations = n;
        }
        if !self.verify_allow.is_empty() {
            config.verify_allowlist = self.verify_allow.clone();
        }
        if let Some(secs) = self.shell_timeout_secs {
            config.shell_timeout = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the agent loop on a task using the Ollama model
    Run {
        /// Task description given to the model
        task: String,

        /// Conversation id (scopes the default patch set)
        #[arg(long)]
        conversation_id: Option<String>,
    },
    /// Inspect and apply staged patch sets
    Patches {
        #[command(subcommand)]
        action: PatchesAction,
    },
    /// List and restore checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointsAction,
    },
}

#[derive(Subcommand)]
pub enum PatchesAction {
    /// List patch sets, most recently updated first
    List,
    /// Show the entries of a patch set
    Show {
        patch_set_id: String,

        /// Print staged file contents
        #[arg(long)]
        content: bool,
    },
    /// Apply a patch set behind a checkpoint
    Apply { patch_set_id: String },
    /// Discard a patch set
    Clear { patch_set_id: String },
}

#[derive(Subcommand)]
pub enum CheckpointsAction {
    /// List checkpoints, oldest first
    List,
    /// Restore the files recorded in a checkpoint
    Restore { checkpoint_id: String },
}
