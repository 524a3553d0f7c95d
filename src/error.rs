//! Error types shared across the crate.
//!
//! Tool-level failures ([`ToolError`]) never escape the scheduler: they are
//! rendered into tool result messages so the model can correct itself on the
//! next round. Store failures ([`StoreError`]) come from the patch set store
//! and the checkpoint manager. [`RegistryError`] and [`ConfigError`] are the
//! only startup-fatal errors.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Missing required argument '{name}'")]
    MissingArgument { name: String },

    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("Tool '{name}' not found. Available tools: {}", .available.join(", "))]
    ToolNotFound { name: String, available: Vec<String> },

    #[error("File '{path}' not found")]
    FileNotFound { path: String },

    #[error("File '{path}' already exists; use write_file to replace its content")]
    AlreadyExists { path: String },

    #[error("Command '{command}' is not allowlisted{}. Allowed prefixes: {}", detail_suffix(.detail), quoted(.allowed))]
    NotAllowlisted {
        command: String,
        allowed: Vec<String>,
        detail: Option<String>,
    },

    #[error("Command timed out after {timeout_secs}s and was terminated\n{output}")]
    TimedOut { timeout_secs: u64, output: String },

    #[error("Tool call was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(" ({})", d),
        None => String::new(),
    }
}

fn quoted(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("\"{}\"", v))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ToolError {
    pub fn missing(name: impl Into<String>) -> Self {
        ToolError::MissingArgument { name: name.into() }
    }

    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ToolError::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the patch set store and the checkpoint manager.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Patch set '{0}' not found")]
    PatchSetNotFound(String),

    #[error("Checkpoint '{0}' not found")]
    CheckpointNotFound(String),

    #[error("Checkpoint '{0}' already exists")]
    CheckpointExists(String),

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid identifier '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    /// A write or delete failed part-way through an apply. Entries before
    /// `path` are on disk; the checkpoint holds the pre-apply state.
    #[error("Apply stopped at '{path}': {source}. Checkpoint '{checkpoint_id}' holds the pre-apply state and can be restored")]
    ApplyInterrupted {
        checkpoint_id: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest at {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Tool registration errors. Programmer error, fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool '{0}' is registered twice")]
    DuplicateTool(String),

    #[error("Tool '{0}' is required but not registered")]
    MissingTool(String),
}

/// Invalid configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
