//! JSON manifest persistence.
//!
//! Manifests are written to a temporary sibling and renamed into place so a
//! reader never sees a half-written file, even across a crash.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::error::StoreError;

/// File name of the manifest inside a patch set or checkpoint directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    write_bytes_atomic(path, &content).await
}

/// Atomically replace `path` with `content`, creating parent directories.
pub async fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StoreError::io(&parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    if let Err(e) = fs::write(&tmp_path, content).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::io(&tmp_path, e));
    }
    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Read and parse a JSON file. A missing file is `Ok(None)`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(value))
}

/// Validate an identifier used as a directory name (patch set or checkpoint id).
///
/// Allowed: ASCII letters, digits, `-`, `_` and `.`, not starting with `.`,
/// at most 128 characters.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let reason = if id.is_empty() {
        Some("identifier is empty")
    } else if id.len() > 128 {
        Some("identifier is longer than 128 characters")
    } else if id.starts_with('.') {
        Some("identifier must not start with '.'")
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidId {
            id: id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_write_then_read_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(MANIFEST_FILE);
        let sample = Sample {
            name: "a".to_string(),
            count: 3,
        };

        write_json_atomic(&path, &sample).await.unwrap();
        let loaded: Option<Sample> = read_json(&path).await.unwrap();
        assert_eq!(loaded, Some(sample));

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let loaded: Option<Sample> = read_json(&temp_dir.path().join("missing.json"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_read_corrupt_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, "{not json").unwrap();
        let result: Result<Option<Sample>, _> = read_json(&path).await;
        assert!(matches!(result, Err(StoreError::Manifest { .. })));
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("feature-1").is_ok());
        assert!(validate_id("conv_abc.2").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id(".hidden").is_err());
        assert!(validate_id(&"x".repeat(129)).is_err());
    }
}
