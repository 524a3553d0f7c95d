//! Pre-apply snapshots and rollback.
//!
//! Layout under the project state directory:
//!
//! ```text
//! checkpoints/<checkpoint_id>/manifest.json
//! checkpoints/<checkpoint_id>/<sha256(relative_path)>.snapshot
//! ```
//!
//! Checkpoint ids are uuid v7 strings, so lexical order is creation order.
//! A checkpoint directory without a manifest is an incomplete creation and is
//! ignored by [`CheckpointManager::list_checkpoints`].

mod manifest;

pub use manifest::{snapshot_file_name, CheckpointEntry, CheckpointManifest};

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::events::FileEvent;
use crate::persist::{read_json, validate_id, write_bytes_atomic, write_json_atomic, MANIFEST_FILE};
use crate::project::ProjectRoot;

const CHECKPOINTS_DIR: &str = "checkpoints";

/// Result of restoring a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub checkpoint_id: String,
    /// Every path recorded in the checkpoint, in manifest order.
    pub paths: Vec<String>,
    /// Paths whose on-disk state actually changed.
    pub changes: Vec<FileEvent>,
}

/// Creates, lists and restores checkpoints for one project.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    project: ProjectRoot,
}

impl CheckpointManager {
    pub fn new(project: ProjectRoot) -> Self {
        Self { project }
    }

    fn checkpoints_dir(&self) -> PathBuf {
        self.project.state_dir().join(CHECKPOINTS_DIR)
    }

    fn checkpoint_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir().join(checkpoint_id)
    }

    /// Snapshot `paths` (root-relative, normalized) and persist the manifest.
    ///
    /// Duplicate paths are recorded once. Returns the new checkpoint id.
    pub async fn create_checkpoint(
        &self,
        paths: &[String],
        label: Option<&str>,
    ) -> Result<String, StoreError> {
        self.snapshot(paths, label)
            .await
            .map(|manifest| manifest.checkpoint_id)
    }

    /// Like [`CheckpointManager::create_checkpoint`] but returns the manifest.
    pub async fn snapshot(
        &self,
        paths: &[String],
        label: Option<&str>,
    ) -> Result<CheckpointManifest, StoreError> {
        let checkpoint_id = Uuid::now_v7().to_string();
        let dir = self.checkpoint_dir(&checkpoint_id);

        fs::create_dir_all(self.checkpoints_dir())
            .await
            .map_err(|e| StoreError::io(self.checkpoints_dir(), e))?;
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::CheckpointExists(checkpoint_id));
            }
            Err(e) => return Err(StoreError::io(&dir, e)),
        }

        match self.write_snapshots(&checkpoint_id, paths, label).await {
            Ok(manifest) => {
                info!(
                    "📸 Created checkpoint {} covering {} path(s)",
                    checkpoint_id,
                    manifest.entries.len()
                );
                Ok(manifest)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dir).await {
                    warn!(
                        "Failed to remove incomplete checkpoint {}: {}",
                        checkpoint_id, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_snapshots(
        &self,
        checkpoint_id: &str,
        paths: &[String],
        label: Option<&str>,
    ) -> Result<CheckpointManifest, StoreError> {
        let dir = self.checkpoint_dir(checkpoint_id);
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for relative_path in paths {
            if !seen.insert(relative_path.as_str()) {
                continue;
            }
            let absolute = self.project.contained(relative_path)?;
            let entry = match fs::read(&absolute).await {
                Ok(content) => {
                    let snapshot_file = snapshot_file_name(relative_path);
                    fs::write(dir.join(&snapshot_file), &content)
                        .await
                        .map_err(|e| StoreError::io(dir.join(&snapshot_file), e))?;
                    debug!("Snapshot {} ({} bytes)", relative_path, content.len());
                    CheckpointEntry {
                        relative_path: relative_path.clone(),
                        existed_before: true,
                        snapshot_file: Some(snapshot_file),
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => CheckpointEntry {
                    relative_path: relative_path.clone(),
                    existed_before: false,
                    snapshot_file: None,
                },
                Err(e) => return Err(StoreError::io(absolute, e)),
            };
            entries.push(entry);
        }

        let manifest = CheckpointManifest {
            checkpoint_id: checkpoint_id.to_string(),
            created_at: Utc::now(),
            label: label.map(str::to_string),
            entries,
        };
        // The manifest goes last: its presence marks the checkpoint complete
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest).await?;
        Ok(manifest)
    }

    pub async fn load_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointManifest>, StoreError> {
        validate_id(checkpoint_id)?;
        read_json(&self.checkpoint_dir(checkpoint_id).join(MANIFEST_FILE)).await
    }

    /// All complete checkpoints, oldest first.
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointManifest>, StoreError> {
        let root = self.checkpoints_dir();
        let mut reader = match fs::read_dir(&root).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&root, e)),
        };

        let mut manifests = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&root, e))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_json::<CheckpointManifest>(&path.join(MANIFEST_FILE)).await {
                Ok(Some(manifest)) => manifests.push(manifest),
                Ok(None) => debug!("Skipping incomplete checkpoint {}", path.display()),
                Err(e) => warn!("Skipping unreadable checkpoint: {}", e),
            }
        }

        manifests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
        });
        Ok(manifests)
    }

    /// Put every recorded path back into its pre-apply state.
    ///
    /// Paths that existed are rewritten from their snapshot; paths that did
    /// not exist are removed. Running it twice leaves the same result.
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<RestoreOutcome, StoreError> {
        let manifest = self
            .load_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| StoreError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let dir = self.checkpoint_dir(checkpoint_id);

        let mut changes = Vec::new();
        for entry in &manifest.entries {
            let absolute = self.project.contained(&entry.relative_path)?;
            let current = match fs::read(&absolute).await {
                Ok(content) => Some(content),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(StoreError::io(&absolute, e)),
            };

            match (&entry.snapshot_file, entry.existed_before) {
                (Some(snapshot_file), true) => {
                    let snapshot_path = dir.join(snapshot_file);
                    let content = fs::read(&snapshot_path)
                        .await
                        .map_err(|e| StoreError::io(&snapshot_path, e))?;
                    if current.as_deref() == Some(content.as_slice()) {
                        continue;
                    }
                    write_bytes_atomic(&absolute, &content).await?;
                    changes.extend(FileEvent::from_transition(
                        &entry.relative_path,
                        current.is_some(),
                        true,
                    ));
                }
                _ => {
                    if current.is_none() {
                        continue;
                    }
                    match fs::remove_file(&absolute).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(StoreError::io(&absolute, e)),
                    }
                    changes.push(FileEvent::FileDeleted(entry.relative_path.clone()));
                }
            }
        }

        info!(
            "⏪ Restored checkpoint {} ({} path(s), {} changed)",
            checkpoint_id,
            manifest.entries.len(),
            changes.len()
        );

        Ok(RestoreOutcome {
            checkpoint_id: checkpoint_id.to_string(),
            paths: manifest.paths(),
            changes,
        })
    }
}
