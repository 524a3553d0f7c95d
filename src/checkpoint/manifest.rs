use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Pre-apply state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub relative_path: String,
    pub existed_before: bool,
    /// Snapshot file name inside the checkpoint directory. Present iff
    /// `existed_before`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_file: Option<String>,
}

/// Immutable record written once per apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub entries: Vec<CheckpointEntry>,
}

impl CheckpointManifest {
    pub fn paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.relative_path.clone()).collect()
    }
}

/// Snapshot file name for a relative path: `<sha256 hex>.snapshot`.
pub fn snapshot_file_name(relative_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    format!("{:x}.snapshot", hasher.finalize())
}
