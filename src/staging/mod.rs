//! Durable staging area for proposed edits.
//!
//! A patch set is a named, ordered list of [`PatchEntry`] values persisted at
//! `<state_dir>/patch-sets/<id>/manifest.json`. Staging, applying and clearing
//! one id are serialized by a per-id lock; distinct ids do not contend.
//!
//! Every apply that touches a path first takes a checkpoint of exactly the
//! touched paths, so it can be rolled back with
//! [`CheckpointManager::restore_checkpoint`].

mod manifest;

pub use manifest::{PatchEntry, PatchKind, PatchSetManifest, PatchSetSummary};

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::error::StoreError;
use crate::events::FileEvent;
use crate::persist::{read_json, validate_id, write_json_atomic, MANIFEST_FILE};
use crate::project::ProjectRoot;

const PATCH_SETS_DIR: &str = "patch-sets";

/// Result of applying entries to disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Checkpoint holding the pre-apply state. `None` when nothing was touched.
    pub checkpoint_id: Option<String>,
    /// Distinct touched paths in first-seen order.
    pub paths: Vec<String>,
    pub changes: Vec<FileEvent>,
}

/// Patch set persistence and checkpoint-protected apply for one project.
pub struct PatchSetStore {
    project: ProjectRoot,
    checkpoints: Arc<CheckpointManager>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PatchSetStore {
    pub fn new(project: ProjectRoot, checkpoints: Arc<CheckpointManager>) -> Self {
        Self {
            project,
            checkpoints,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn project(&self) -> &ProjectRoot {
        &self.project
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    fn patch_sets_dir(&self) -> PathBuf {
        self.project.state_dir().join(PATCH_SETS_DIR)
    }

    fn manifest_path(&self, patch_set_id: &str) -> PathBuf {
        self.patch_sets_dir().join(patch_set_id).join(MANIFEST_FILE)
    }

    async fn lock_id(&self, patch_set_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop locks nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(patch_set_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn stage_write(
        &self,
        patch_set_id: &str,
        tool_call_id: &str,
        path: &str,
        content: &str,
    ) -> Result<PatchSetManifest, StoreError> {
        let relative = self.project.relative(path)?;
        self.stage(patch_set_id, PatchEntry::write(relative, content, tool_call_id))
            .await
    }

    pub async fn stage_create(
        &self,
        patch_set_id: &str,
        tool_call_id: &str,
        path: &str,
        content: &str,
    ) -> Result<PatchSetManifest, StoreError> {
        let relative = self.project.relative(path)?;
        self.stage(patch_set_id, PatchEntry::create(relative, content, tool_call_id))
            .await
    }

    pub async fn stage_delete(
        &self,
        patch_set_id: &str,
        tool_call_id: &str,
        path: &str,
    ) -> Result<PatchSetManifest, StoreError> {
        let relative = self.project.relative(path)?;
        self.stage(patch_set_id, PatchEntry::delete(relative, tool_call_id))
            .await
    }

    /// Append-or-replace one entry and persist before returning.
    ///
    /// `entry.relative_path` must already be normalized.
    pub async fn stage(
        &self,
        patch_set_id: &str,
        entry: PatchEntry,
    ) -> Result<PatchSetManifest, StoreError> {
        validate_id(patch_set_id)?;
        let _guard = self.lock_id(patch_set_id).await;

        let path = self.manifest_path(patch_set_id);
        let mut manifest = read_json::<PatchSetManifest>(&path)
            .await?
            .unwrap_or_else(|| PatchSetManifest::new(patch_set_id));

        debug!(
            "Staging {} {} into patch set {}",
            entry.kind.as_str(),
            entry.relative_path,
            patch_set_id
        );
        manifest.upsert(entry);
        write_json_atomic(&path, &manifest).await?;
        Ok(manifest)
    }

    /// Apply every entry of a patch set. The manifest is kept.
    pub async fn apply_patch_set(&self, patch_set_id: &str) -> Result<ApplyOutcome, StoreError> {
        validate_id(patch_set_id)?;
        let _guard = self.lock_id(patch_set_id).await;

        let manifest = read_json::<PatchSetManifest>(&self.manifest_path(patch_set_id))
            .await?
            .ok_or_else(|| StoreError::PatchSetNotFound(patch_set_id.to_string()))?;

        let label = format!("apply patch set {}", patch_set_id);
        let outcome = self.apply_entries(&manifest.entries, Some(&label)).await?;
        info!(
            "✅ Applied patch set {} ({} path(s))",
            patch_set_id,
            outcome.paths.len()
        );
        Ok(outcome)
    }

    /// Checkpoint the distinct paths of `entries`, then apply them in order.
    ///
    /// On an I/O failure the remaining entries are skipped and the error
    /// carries the checkpoint id.
    pub async fn apply_entries(
        &self,
        entries: &[PatchEntry],
        label: Option<&str>,
    ) -> Result<ApplyOutcome, StoreError> {
        let paths = manifest::distinct_paths(entries);
        if paths.is_empty() {
            return Ok(ApplyOutcome::default());
        }

        // Symlinks may have changed since staging
        let targets = entries
            .iter()
            .map(|entry| self.project.contained(&entry.relative_path))
            .collect::<Result<Vec<_>, _>>()?;

        let checkpoint = self.checkpoints.snapshot(&paths, label).await?;

        for (entry, absolute) in entries.iter().zip(targets) {
            let result = match entry.kind {
                PatchKind::Write | PatchKind::Create => {
                    write_with_parents(&absolute, entry.content.as_deref().unwrap_or("")).await
                }
                PatchKind::Delete => match fs::remove_file(&absolute).await {
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    other => other,
                },
            };
            if let Err(source) = result {
                warn!(
                    "Apply interrupted at {}: {} (checkpoint {})",
                    entry.relative_path, source, checkpoint.checkpoint_id
                );
                return Err(StoreError::ApplyInterrupted {
                    checkpoint_id: checkpoint.checkpoint_id,
                    path: entry.relative_path.clone(),
                    source,
                });
            }
        }

        let mut changes = Vec::new();
        for before in &checkpoint.entries {
            let exists_after = fs::try_exists(self.project.absolute(&before.relative_path))
                .await
                .unwrap_or(false);
            changes.extend(FileEvent::from_transition(
                &before.relative_path,
                before.existed_before,
                exists_after,
            ));
        }

        Ok(ApplyOutcome {
            checkpoint_id: Some(checkpoint.checkpoint_id),
            paths,
            changes,
        })
    }

    /// Remove a patch set. Returns `false` if it did not exist.
    pub async fn clear_patch_set(&self, patch_set_id: &str) -> Result<bool, StoreError> {
        validate_id(patch_set_id)?;
        let _guard = self.lock_id(patch_set_id).await;

        let dir = self.patch_sets_dir().join(patch_set_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("🧹 Cleared patch set {}", patch_set_id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(dir, e)),
        }
    }

    pub async fn load_manifest(
        &self,
        patch_set_id: &str,
    ) -> Result<Option<PatchSetManifest>, StoreError> {
        validate_id(patch_set_id)?;
        read_json(&self.manifest_path(patch_set_id)).await
    }

    /// Stored patch sets, most recently updated first.
    pub async fn list_patch_sets(&self) -> Result<Vec<PatchSetSummary>, StoreError> {
        let root = self.patch_sets_dir();
        let mut reader = match fs::read_dir(&root).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&root, e)),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&root, e))?
        {
            match read_json::<PatchSetManifest>(&entry.path().join(MANIFEST_FILE)).await {
                Ok(Some(manifest)) => summaries.push(PatchSetSummary::from(&manifest)),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable patch set: {}", e),
            }
        }

        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.patch_set_id.cmp(&b.patch_set_id))
        });
        Ok(summaries)
    }
}

async fn write_with_parents(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await
}
