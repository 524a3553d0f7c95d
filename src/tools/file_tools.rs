//! Built-in file tools.
//!
//! Mutating tools honor the invocation mode: in `apply` mode their changes go
//! to disk through [`PatchSetStore::apply_entries`] (checkpoint first), in
//! `propose` mode they are staged into the invocation's patch set.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use super::types::*;
use super::{schema_for, Mode, Tool, ToolArguments, ToolContext, ToolOutput};
use crate::error::{StoreError, ToolError};
use crate::events::FileEvent;
use crate::scheduler::keys::AccessRule;
use crate::services::ProjectServices;
use crate::staging::{PatchEntry, PatchKind, PatchSetStore};

/// Cap on entries returned by list_files.
const MAX_LIST_ENTRIES: usize = 1000;

/// Default cap on matching lines returned by search_files.
const DEFAULT_MAX_RESULTS: usize = 200;

/// Files larger than this are skipped by search_files (1MB).
const MAX_SEARCH_FILE_SIZE: u64 = 1024 * 1024;

/// Path argument used by the single-file tools.
const PATH_ARG: AccessRule = AccessRule::PathArgument("path");

/// Apply or stage `entries` according to the invocation mode.
async fn commit(
    services: &ProjectServices,
    ctx: &ToolContext,
    tool_name: &str,
    entries: Vec<PatchEntry>,
) -> Result<ToolOutput, ToolError> {
    let summary = entries
        .iter()
        .map(|e| format!("- {} {}", e.kind.as_str(), e.relative_path))
        .collect::<Vec<_>>()
        .join("\n");

    match ctx.invocation.mode {
        Mode::Apply => {
            let label = format!("{} ({})", tool_name, ctx.call_id());
            let outcome = services
                .patches
                .apply_entries(&entries, Some(&label))
                .await?;
            let mut content = format!("Applied {} change(s):\n{}", entries.len(), summary);
            if let Some(checkpoint_id) = &outcome.checkpoint_id {
                content.push_str(&format!(
                    "\nCheckpoint: {} (restore_checkpoint reverts this change)",
                    checkpoint_id
                ));
            }
            Ok(ToolOutput::text(content).with_changes(outcome.changes))
        }
        Mode::Propose => {
            let patch_set_id = &ctx.invocation.patch_set_id;
            let count = entries.len();
            let mut total = 0;
            for entry in entries {
                total = services.patches.stage(patch_set_id, entry).await?.entries.len();
            }
            Ok(ToolOutput::text(format!(
                "Staged {} change(s) in patch set '{}' ({} entries total). Nothing was written to disk; call apply_patch_set to apply.\n{}",
                count, patch_set_id, total, summary
            )))
        }
    }
}

/// Pending state of `relative` in the invocation's patch set when proposing:
/// `Some(Some(content))` for a pending write, `Some(None)` for a pending
/// delete, `None` when the patch set has no say.
async fn pending_state(
    patches: &PatchSetStore,
    ctx: &ToolContext,
    relative: &str,
) -> Result<Option<Option<String>>, ToolError> {
    if ctx.invocation.mode != Mode::Propose {
        return Ok(None);
    }
    let Some(manifest) = patches.load_manifest(&ctx.invocation.patch_set_id).await? else {
        return Ok(None);
    };
    Ok(manifest.last_entry_for(relative).map(|entry| match entry.kind {
        PatchKind::Write | PatchKind::Create => Some(entry.content.clone().unwrap_or_default()),
        PatchKind::Delete => None,
    }))
}

/// Whether `relative` exists from the point of view of this invocation.
async fn effective_exists(
    services: &ProjectServices,
    ctx: &ToolContext,
    relative: &str,
) -> Result<bool, ToolError> {
    if let Some(pending) = pending_state(&services.patches, ctx, relative).await? {
        return Ok(pending.is_some());
    }
    let absolute = services.project.absolute(relative);
    fs::try_exists(&absolute)
        .await
        .map_err(|e| ToolError::io(relative, e))
}

/// Text content of `relative` from the point of view of this invocation.
async fn effective_content(
    services: &ProjectServices,
    ctx: &ToolContext,
    relative: &str,
) -> Result<Option<String>, ToolError> {
    if let Some(pending) = pending_state(&services.patches, ctx, relative).await? {
        return Ok(pending);
    }
    read_text(services, relative).await
}

async fn read_text(services: &ProjectServices, relative: &str) -> Result<Option<String>, ToolError> {
    match fs::read_to_string(services.project.absolute(relative)).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) if e.kind() == ErrorKind::InvalidData => Err(ToolError::Failed(format!(
            "File '{}' is not valid UTF-8 text",
            relative
        ))),
        Err(e) => Err(ToolError::io(relative, e)),
    }
}

/// Resolve an optional directory argument to an absolute directory.
fn resolve_dir(services: &ProjectServices, path: Option<&str>) -> Result<PathBuf, ToolError> {
    let root = services.project.canonical().to_path_buf();
    let dir = match path.map(str::trim) {
        None | Some("") | Some(".") | Some("./") => root,
        Some(path) => {
            let relative = services.project.relative(path)?;
            services.project.absolute(&relative)
        }
    };
    if !dir.is_dir() {
        return Err(ToolError::FileNotFound {
            path: path.unwrap_or(".").to_string(),
        });
    }
    Ok(dir)
}

fn describe_changes(changes: &[FileEvent]) -> String {
    changes
        .iter()
        .map(|change| match change {
            FileEvent::FileCreated(p) => format!("- created {}", p),
            FileEvent::FileModified(p) => format!("- modified {}", p),
            FileEvent::FileDeleted(p) => format!("- deleted {}", p),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ReadFileTool {
    services: Arc<ProjectServices>,
}

impl ReadFileTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the project. Optionally restrict to a 1-based inclusive line range."
    }

    fn parameters(&self) -> Value {
        schema_for::<ReadFileArgs>()
    }

    fn access(&self) -> AccessRule {
        AccessRule::ReadOnly
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let relative = self.services.project.relative(args.require_str("path")?)?;
        let content = read_text(&self.services, &relative)
            .await?
            .ok_or_else(|| ToolError::FileNotFound {
                path: relative.clone(),
            })?;

        let start = args.u64("start_line")?.map(|n| n as usize);
        let end = args.u64("end_line")?.map(|n| n as usize);
        if start.is_none() && end.is_none() {
            return Ok(ToolOutput::text(content));
        }

        let start = start.unwrap_or(1).max(1);
        let end = end.unwrap_or(usize::MAX);
        if end < start {
            return Err(ToolError::invalid(
                "end_line",
                format!("must not be before start_line ({})", start),
            ));
        }
        let selected = content
            .lines()
            .enumerate()
            .filter(|(i, _)| (start..=end).contains(&(i + 1)))
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutput::text(selected))
    }
}

pub struct ListFilesTool {
    services: Arc<ProjectServices>,
}

impl ListFilesTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List project files and directories (directories end with '/'). Honors .gitignore."
    }

    fn parameters(&self) -> Value {
        schema_for::<ListFilesArgs>()
    }

    fn access(&self) -> AccessRule {
        AccessRule::ReadOnly
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let dir = resolve_dir(&self.services, args.str("path"))?;
        let max_depth = args.u64("max_depth")?.map(|d| d as usize);
        let services = self.services.clone();

        let (entries, truncated) = tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            let mut truncated = false;
            for entry in services.project.walker(&dir, max_depth).build() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Error walking directory: {}", e);
                        continue;
                    }
                };
                if entry.depth() == 0 {
                    continue;
                }
                if entries.len() >= MAX_LIST_ENTRIES {
                    truncated = true;
                    break;
                }
                let mut display = services.project.display_relative(entry.path());
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    display.push('/');
                }
                entries.push(display);
            }
            entries.sort();
            (entries, truncated)
        })
        .await
        .map_err(|e| ToolError::Failed(format!("Listing failed: {}", e)))?;

        if entries.is_empty() {
            return Ok(ToolOutput::text("No files found"));
        }
        let mut content = entries.join("\n");
        if truncated {
            content.push_str(&format!("\n... (truncated at {} entries)", MAX_LIST_ENTRIES));
        }
        Ok(ToolOutput::text(content))
    }
}

pub struct SearchFilesTool {
    services: Arc<ProjectServices>,
}

impl SearchFilesTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search project files line by line with a regular expression. Results are 'path:line: text'."
    }

    fn parameters(&self) -> Value {
        schema_for::<SearchFilesArgs>()
    }

    fn access(&self) -> AccessRule {
        AccessRule::ReadOnly
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let pattern = args.require_str("pattern")?.to_string();
        let regex = Regex::new(&pattern).map_err(|e| ToolError::invalid("pattern", e.to_string()))?;
        let dir = resolve_dir(&self.services, args.str("path"))?;
        let max_results = args
            .u64("max_results")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .max(1);
        let services = self.services.clone();

        let (matches, truncated) = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            for entry in services.project.walker(&dir, None).build().flatten() {
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let too_big = entry
                    .metadata()
                    .map(|m| m.len() > MAX_SEARCH_FILE_SIZE)
                    .unwrap_or(true);
                if too_big {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let display = services.project.display_relative(entry.path());
                for (index, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        if matches.len() >= max_results {
                            return (matches, true);
                        }
                        matches.push(format!("{}:{}: {}", display, index + 1, line.trim_end()));
                    }
                }
            }
            (matches, false)
        })
        .await
        .map_err(|e| ToolError::Failed(format!("Search failed: {}", e)))?;

        if matches.is_empty() {
            return Ok(ToolOutput::text(format!("No matches for pattern '{}'", pattern)));
        }
        let mut content = matches.join("\n");
        if truncated {
            content.push_str(&format!("\n... (stopped after {} matches)", max_results));
        }
        Ok(ToolOutput::text(content))
    }
}

pub struct WriteFileTool {
    services: Arc<ProjectServices>,
}

impl WriteFileTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write the complete content of a file, creating it and its parent directories if needed."
    }

    fn parameters(&self) -> Value {
        schema_for::<WriteFileArgs>()
    }

    fn access(&self) -> AccessRule {
        PATH_ARG
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let relative = self.services.project.relative(args.require_str("path")?)?;
        let content = args.require_text("content")?;
        let entry = PatchEntry::write(relative, content, ctx.call_id());
        commit(&self.services, ctx, self.name(), vec![entry]).await
    }
}

pub struct CreateFileTool {
    services: Arc<ProjectServices>,
}

impl CreateFileTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a new file. Fails if the file already exists; use write_file to replace content."
    }

    fn parameters(&self) -> Value {
        schema_for::<CreateFileArgs>()
    }

    fn access(&self) -> AccessRule {
        PATH_ARG
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let relative = self.services.project.relative(args.require_str("path")?)?;
        let content = args.require_text("content")?;
        if effective_exists(&self.services, ctx, &relative).await? {
            return Err(ToolError::AlreadyExists { path: relative });
        }
        let entry = PatchEntry::create(relative, content, ctx.call_id());
        commit(&self.services, ctx, self.name(), vec![entry]).await
    }
}

pub struct DeleteFileTool {
    services: Arc<ProjectServices>,
}

impl DeleteFileTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a file from the project."
    }

    fn parameters(&self) -> Value {
        schema_for::<DeleteFileArgs>()
    }

    fn access(&self) -> AccessRule {
        PATH_ARG
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let relative = self.services.project.relative(args.require_str("path")?)?;
        if !effective_exists(&self.services, ctx, &relative).await? {
            return Err(ToolError::FileNotFound { path: relative });
        }
        let entry = PatchEntry::delete(relative, ctx.call_id());
        commit(&self.services, ctx, self.name(), vec![entry]).await
    }
}

pub struct ReplaceInFileTool {
    services: Arc<ProjectServices>,
}

impl ReplaceInFileTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> &str {
        "replace_in_file"
    }

    fn description(&self) -> &str {
        "Replace exact text in a file. old_text must match exactly once unless replace_all is true."
    }

    fn parameters(&self) -> Value {
        schema_for::<ReplaceInFileArgs>()
    }

    fn access(&self) -> AccessRule {
        PATH_ARG
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let relative = self.services.project.relative(args.require_str("path")?)?;
        let old_text = args.require_text("old_text")?;
        let new_text = args.require_text("new_text")?;
        let replace_all = args.bool("replace_all")?.unwrap_or(false);
        if old_text.is_empty() {
            return Err(ToolError::invalid("old_text", "must not be empty"));
        }

        let current = effective_content(&self.services, ctx, &relative)
            .await?
            .ok_or_else(|| ToolError::FileNotFound {
                path: relative.clone(),
            })?;

        let occurrences = current.matches(old_text).count();
        if occurrences == 0 {
            return Err(ToolError::invalid(
                "old_text",
                format!("text not found in '{}'", relative),
            ));
        }
        if occurrences > 1 && !replace_all {
            return Err(ToolError::invalid(
                "old_text",
                format!(
                    "matches {} times in '{}'; include more surrounding text or set replace_all to true",
                    occurrences, relative
                ),
            ));
        }

        let updated = if replace_all {
            current.replace(old_text, new_text)
        } else {
            current.replacen(old_text, new_text, 1)
        };
        let entry = PatchEntry::write(relative, updated, ctx.call_id());
        commit(&self.services, ctx, self.name(), vec![entry]).await
    }
}

pub struct BatchWriteTool {
    services: Arc<ProjectServices>,
}

impl BatchWriteTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for BatchWriteTool {
    fn name(&self) -> &str {
        "batch_write"
    }

    fn description(&self) -> &str {
        "Write several files as one change, behind a single checkpoint."
    }

    fn parameters(&self) -> Value {
        schema_for::<BatchWriteArgs>()
    }

    fn access(&self) -> AccessRule {
        AccessRule::PathList {
            array: "files",
            field: "path",
        }
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let files = args.get("files").ok_or_else(|| ToolError::missing("files"))?;
        let files: Vec<FileContent> = serde_json::from_value(files.clone())
            .map_err(|e| ToolError::invalid("files", e.to_string()))?;
        if files.is_empty() {
            return Err(ToolError::invalid("files", "must list at least one file"));
        }

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let relative = self.services.project.relative(&file.path)?;
            entries.push(PatchEntry::write(relative, file.content, ctx.call_id()));
        }
        commit(&self.services, ctx, self.name(), entries).await
    }
}

pub struct ShowPatchSetTool {
    services: Arc<ProjectServices>,
}

impl ShowPatchSetTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for ShowPatchSetTool {
    fn name(&self) -> &str {
        "show_patch_set"
    }

    fn description(&self) -> &str {
        "Show the staged entries of a patch set."
    }

    fn parameters(&self) -> Value {
        schema_for::<PatchSetArgs>()
    }

    fn access(&self) -> AccessRule {
        AccessRule::ReadOnly
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let patch_set_id = &ctx.invocation.patch_set_id;
        let manifest = self
            .services
            .patches
            .load_manifest(patch_set_id)
            .await?
            .ok_or_else(|| StoreError::PatchSetNotFound(patch_set_id.clone()))?;

        let mut lines = vec![format!(
            "Patch set '{}' ({} entries, updated {})",
            manifest.patch_set_id,
            manifest.entries.len(),
            manifest.updated_at.to_rfc3339()
        )];
        for entry in &manifest.entries {
            let size = entry
                .content
                .as_ref()
                .map(|c| format!(" ({} bytes)", c.len()))
                .unwrap_or_default();
            lines.push(format!(
                "- {} {}{} [call {}]",
                entry.kind.as_str(),
                entry.relative_path,
                size,
                entry.tool_call_id
            ));
        }
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

pub struct ApplyPatchSetTool {
    services: Arc<ProjectServices>,
}

impl ApplyPatchSetTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for ApplyPatchSetTool {
    fn name(&self) -> &str {
        "apply_patch_set"
    }

    fn description(&self) -> &str {
        "Apply every staged entry of a patch set to disk, behind one checkpoint."
    }

    fn parameters(&self) -> Value {
        schema_for::<PatchSetArgs>()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let patch_set_id = &ctx.invocation.patch_set_id;
        let outcome = self.services.patches.apply_patch_set(patch_set_id).await?;

        let mut content = format!(
            "Applied patch set '{}' ({} path(s))",
            patch_set_id,
            outcome.paths.len()
        );
        if !outcome.changes.is_empty() {
            content.push('\n');
            content.push_str(&describe_changes(&outcome.changes));
        }
        if let Some(checkpoint_id) = &outcome.checkpoint_id {
            content.push_str(&format!("\nCheckpoint: {}", checkpoint_id));
        }
        Ok(ToolOutput::text(content).with_changes(outcome.changes))
    }
}

pub struct ClearPatchSetTool {
    services: Arc<ProjectServices>,
}

impl ClearPatchSetTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for ClearPatchSetTool {
    fn name(&self) -> &str {
        "clear_patch_set"
    }

    fn description(&self) -> &str {
        "Discard a patch set and all its staged entries. Files on disk are not touched."
    }

    fn parameters(&self) -> Value {
        schema_for::<PatchSetArgs>()
    }

    fn access(&self) -> AccessRule {
        AccessRule::PatchSet
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        _args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let patch_set_id = &ctx.invocation.patch_set_id;
        let message = if self.services.patches.clear_patch_set(patch_set_id).await? {
            format!("Cleared patch set '{}'", patch_set_id)
        } else {
            format!("Patch set '{}' did not exist; nothing to clear", patch_set_id)
        };
        Ok(ToolOutput::text(message))
    }
}

pub struct RestoreCheckpointTool {
    services: Arc<ProjectServices>,
}

impl RestoreCheckpointTool {
    pub fn new(services: Arc<ProjectServices>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Tool for RestoreCheckpointTool {
    fn name(&self) -> &str {
        "restore_checkpoint"
    }

    fn description(&self) -> &str {
        "Revert every file recorded in a checkpoint to its state before the apply that created it."
    }

    fn parameters(&self) -> Value {
        schema_for::<RestoreCheckpointArgs>()
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        args: &ToolArguments,
    ) -> Result<ToolOutput, ToolError> {
        let checkpoint_id = args.require_str("checkpoint_id")?.trim();
        let outcome = self
            .services
            .checkpoints
            .restore_checkpoint(checkpoint_id)
            .await?;

        let mut content = format!(
            "Restored checkpoint '{}' ({} path(s), {} changed)",
            checkpoint_id,
            outcome.paths.len(),
            outcome.changes.len()
        );
        if !outcome.changes.is_empty() {
            content.push('\n');
            content.push_str(&describe_changes(&outcome.changes));
        }
        Ok(ToolOutput::text(content).with_changes(outcome.changes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::tools::{InvocationDefaults, ToolInvocationContext};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn services(temp_dir: &TempDir) -> Arc<ProjectServices> {
        ProjectServices::open(temp_dir.path(), CoreConfig::default()).unwrap()
    }

    fn ctx(mode: Mode, patch_set_id: &str) -> ToolContext {
        ToolContext {
            invocation: ToolInvocationContext {
                tool_call_id: "call-1".to_string(),
                mode,
                patch_set_id: patch_set_id.to_string(),
            },
            cancel: CancellationToken::new(),
        }
    }

    fn args(value: Value) -> ToolArguments {
        ToolArguments::from(value)
    }

    #[tokio::test]
    async fn test_write_file_apply_mode_writes_and_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir);
        let tool = WriteFileTool::new(services.clone());

        let output = tool
            .execute(
                &ctx(Mode::Apply, "p"),
                &args(json!({ "path": "src/new.rs", "content": "fn main() {}\n" })),
            )
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("src/new.rs")).unwrap(),
            "fn main() {}\n"
        );
        assert_eq!(
            output.changes,
            vec![FileEvent::FileCreated("src/new.rs".to_string())]
        );
        assert!(output.content.contains("Checkpoint:"));
        assert_eq!(services.checkpoints.list_checkpoints().await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "outside").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("link")).unwrap();
        let services = services(&temp_dir);

        let err = WriteFileTool::new(services.clone())
            .execute(
                &ctx(Mode::Apply, "p"),
                &args(json!({ "path": "link/pwned.txt", "content": "x" })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside the project root"));
        assert!(!outside.path().join("pwned.txt").exists());

        let read = ReadFileTool::new(services.clone())
            .execute(&ctx(Mode::Apply, "p"), &args(json!({ "path": "link/secret.txt" })))
            .await;
        assert!(read.is_err());

        let delete = DeleteFileTool::new(services.clone())
            .execute(&ctx(Mode::Apply, "p"), &args(json!({ "path": "link/secret.txt" })))
            .await;
        assert!(delete.is_err());
        assert!(outside.path().join("secret.txt").exists());
    }

    #[tokio::test]
    async fn test_write_file_propose_mode_only_stages() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir);
        let tool = WriteFileTool::new(services.clone());

        let output = tool
            .execute(
                &ctx(Mode::Propose, "feature"),
                &args(json!({ "path": "a.txt", "content": "" })),
            )
            .await
            .unwrap();

        assert!(output.changes.is_empty());
        assert!(output.content.contains("patch set 'feature'"));
        assert!(!temp_dir.path().join("a.txt").exists());
        let manifest = services.patches.load_manifest("feature").await.unwrap().unwrap();
        assert_eq!(manifest.entries[0].content.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_create_file_refuses_existing_and_leaves_it() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("exists.txt"), "keep me").unwrap();
        let services = services(&temp_dir);
        let tool = CreateFileTool::new(services.clone());

        let err = tool
            .execute(
                &ctx(Mode::Apply, "p"),
                &args(json!({ "path": "exists.txt", "content": "overwrite" })),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("already exists"));
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("exists.txt")).unwrap(),
            "keep me"
        );
        assert!(services.checkpoints.list_checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_file_sees_pending_entries_when_proposing() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir);
        let tool = CreateFileTool::new(services.clone());
        let propose = ctx(Mode::Propose, "p");

        tool.execute(&propose, &args(json!({ "path": "new.txt", "content": "a" })))
            .await
            .unwrap();
        let err = tool
            .execute(&propose, &args(json!({ "path": "new.txt", "content": "b" })))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let tool = DeleteFileTool::new(services(&temp_dir));

        let err = tool
            .execute(&ctx(Mode::Apply, "p"), &args(json!({ "path": "ghost.txt" })))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File 'ghost.txt' not found");
    }

    #[tokio::test]
    async fn test_replace_in_file_requires_unique_match() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.rs"), "let x = 1;\nlet x = 1;\n").unwrap();
        let tool = ReplaceInFileTool::new(services(&temp_dir));
        let apply = ctx(Mode::Apply, "p");

        let err = tool
            .execute(
                &apply,
                &args(json!({ "path": "a.rs", "old_text": "x = 1", "new_text": "y = 2" })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("matches 2 times"));

        tool.execute(
            &apply,
            &args(json!({
                "path": "a.rs",
                "old_text": "x = 1",
                "new_text": "y = 2",
                "replace_all": "true",
            })),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("a.rs")).unwrap(),
            "let y = 2;\nlet y = 2;\n"
        );
    }

    #[tokio::test]
    async fn test_replace_in_file_builds_on_pending_content() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "disk").unwrap();
        let services = services(&temp_dir);
        let propose = ctx(Mode::Propose, "p");

        WriteFileTool::new(services.clone())
            .execute(&propose, &args(json!({ "path": "a.txt", "content": "staged text" })))
            .await
            .unwrap();
        ReplaceInFileTool::new(services.clone())
            .execute(
                &propose,
                &args(json!({ "path": "a.txt", "old_text": "staged", "new_text": "edited" })),
            )
            .await
            .unwrap();

        let manifest = services.patches.load_manifest("p").await.unwrap().unwrap();
        assert_eq!(
            manifest.last_entry_for("a.txt").unwrap().content.as_deref(),
            Some("edited text")
        );
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("a.txt")).unwrap(),
            "disk"
        );
    }

    #[tokio::test]
    async fn test_batch_write_uses_one_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir);
        let tool = BatchWriteTool::new(services.clone());

        let output = tool
            .execute(
                &ctx(Mode::Apply, "p"),
                &args(json!({ "files": [
                    { "path": "a.txt", "content": "A" },
                    { "path": "dir/b.txt", "content": "B" },
                ]})),
            )
            .await
            .unwrap();

        assert_eq!(output.changes.len(), 2);
        assert_eq!(services.checkpoints.list_checkpoints().await.unwrap().len(), 1);
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("dir/b.txt")).unwrap(),
            "B"
        );

        let err = tool
            .execute(&ctx(Mode::Apply, "p"), &args(json!({ "files": [] })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'files'"));
    }

    #[tokio::test]
    async fn test_patch_set_tools_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir);
        let defaults = InvocationDefaults::new(Mode::Propose, "conversation");
        let patch_set_id = defaults.default_patch_set_id();
        let propose = ctx(Mode::Propose, &patch_set_id);

        WriteFileTool::new(services.clone())
            .execute(&propose, &args(json!({ "path": "out.txt", "content": "C" })))
            .await
            .unwrap();

        let shown = ShowPatchSetTool::new(services.clone())
            .execute(&propose, &args(json!({})))
            .await
            .unwrap();
        assert!(shown.content.contains("- write out.txt (1 bytes)"));

        let applied = ApplyPatchSetTool::new(services.clone())
            .execute(&propose, &args(json!({})))
            .await
            .unwrap();
        assert!(applied.content.contains("created out.txt"));
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("out.txt")).unwrap(),
            "C"
        );

        let cleared = ClearPatchSetTool::new(services.clone())
            .execute(&propose, &args(json!({})))
            .await
            .unwrap();
        assert!(cleared.content.starts_with("Cleared"));

        let err = ApplyPatchSetTool::new(services.clone())
            .execute(&propose, &args(json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_restore_checkpoint_tool() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "before").unwrap();
        let services = services(&temp_dir);

        WriteFileTool::new(services.clone())
            .execute(&ctx(Mode::Apply, "p"), &args(json!({ "path": "a.txt", "content": "after" })))
            .await
            .unwrap();
        let checkpoint_id = services.checkpoints.list_checkpoints().await.unwrap()[0]
            .checkpoint_id
            .clone();

        let output = RestoreCheckpointTool::new(services.clone())
            .execute(
                &ctx(Mode::Apply, "p"),
                &args(json!({ "checkpoint_id": checkpoint_id })),
            )
            .await
            .unwrap();
        assert_eq!(
            output.changes,
            vec![FileEvent::FileModified("a.txt".to_string())]
        );
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("a.txt")).unwrap(),
            "before"
        );
    }

    #[tokio::test]
    async fn test_read_list_and_search() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("src")).unwrap();
        std::fs::write(
            temp_dir.path().join("src/lib.rs"),
            "pub fn alpha() {}\npub fn beta() {}\n",
        )
        .unwrap();
        let services = services(&temp_dir);
        let apply = ctx(Mode::Apply, "p");

        let read = ReadFileTool::new(services.clone())
            .execute(
                &apply,
                &args(json!({ "path": "src/lib.rs", "start_line": 2, "end_line": 2 })),
            )
            .await
            .unwrap();
        assert_eq!(read.content, "pub fn beta() {}");

        let listed = ListFilesTool::new(services.clone())
            .execute(&apply, &args(json!({})))
            .await
            .unwrap();
        assert!(listed.content.contains("src/"));
        assert!(listed.content.contains("src/lib.rs"));

        let found = SearchFilesTool::new(services.clone())
            .execute(&apply, &args(json!({ "pattern": "fn b\\w+" })))
            .await
            .unwrap();
        assert_eq!(found.content, "src/lib.rs:2: pub fn beta() {}");

        let err = SearchFilesTool::new(services.clone())
            .execute(&apply, &args(json!({ "pattern": "(" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid argument 'pattern'"));

        let err = ReadFileTool::new(services)
            .execute(&apply, &args(json!({ "path": "missing.rs" })))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::FileNotFound { .. }));
    }
}
