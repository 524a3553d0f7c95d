//! Built-in tool parameter types.
//!
//! Deserialized from [`super::ToolArguments`] and used to generate the JSON
//! schemas advertised to the model.

use schemars::JsonSchema;
use serde::Deserialize;

use super::Mode;

/// Staging controls shared by every mutating file tool.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct StagingArgs {
    /// "apply" writes to disk behind a checkpoint; "propose" stages the change
    /// into a patch set without touching project files
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Patch set receiving proposed changes (defaults to the conversation's)
    #[serde(default)]
    pub patch_set_id: Option<String>,
}

/// Parameters for the read_file tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// File path, relative to the project root
    pub path: String,
    /// First line to return (1-based, inclusive)
    #[serde(default)]
    pub start_line: Option<usize>,
    /// Last line to return (1-based, inclusive)
    #[serde(default)]
    pub end_line: Option<usize>,
}

/// Parameters for the list_files tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesArgs {
    /// Directory to list, relative to the project root (defaults to the root)
    #[serde(default)]
    pub path: Option<String>,
    /// Maximum directory depth to descend
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// Parameters for the search_files tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchFilesArgs {
    /// Regular expression matched against each line
    pub pattern: String,
    /// Directory to search, relative to the project root (defaults to the root)
    #[serde(default)]
    pub path: Option<String>,
    /// Maximum number of matching lines to return
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// Parameters for the write_file tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    /// File path, relative to the project root
    pub path: String,
    /// Complete new file content
    pub content: String,
    #[serde(flatten)]
    pub staging: StagingArgs,
}

/// Parameters for the create_file tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateFileArgs {
    /// Path of the new file, relative to the project root
    pub path: String,
    /// File content
    pub content: String,
    #[serde(flatten)]
    pub staging: StagingArgs,
}

/// Parameters for the delete_file tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteFileArgs {
    /// File path, relative to the project root
    pub path: String,
    #[serde(flatten)]
    pub staging: StagingArgs,
}

/// Parameters for the replace_in_file tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReplaceInFileArgs {
    /// File path, relative to the project root
    pub path: String,
    /// Exact text to find
    pub old_text: String,
    /// Replacement text
    pub new_text: String,
    /// Replace every occurrence instead of requiring a unique match
    #[serde(default)]
    pub replace_all: Option<bool>,
    #[serde(flatten)]
    pub staging: StagingArgs,
}

/// One file of a batch write
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FileContent {
    /// File path, relative to the project root
    pub path: String,
    /// Complete new file content
    pub content: String,
}

/// Parameters for the batch_write tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct BatchWriteArgs {
    /// Files to write, applied in order
    pub files: Vec<FileContent>,
    #[serde(flatten)]
    pub staging: StagingArgs,
}

/// Parameters for tools addressing a patch set
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PatchSetArgs {
    /// Patch set id (defaults to the conversation's patch set)
    #[serde(default)]
    pub patch_set_id: Option<String>,
}

/// Parameters for the restore_checkpoint tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RestoreCheckpointArgs {
    /// Checkpoint id returned by an earlier apply
    pub checkpoint_id: String,
}

/// Parameters for the run_command tool
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandArgs {
    /// Shell command, run with `sh -c` in the project root
    pub command: String,
    /// Timeout in seconds (capped by the configured limit)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}
