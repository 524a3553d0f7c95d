//! Per-project service objects, constructed once and shared by `Arc`.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::checkpoint::CheckpointManager;
use crate::config::CoreConfig;
use crate::error::ConfigError;
use crate::project::ProjectRoot;
use crate::staging::PatchSetStore;

pub struct ProjectServices {
    pub project: ProjectRoot,
    pub patches: Arc<PatchSetStore>,
    pub checkpoints: Arc<CheckpointManager>,
    pub config: CoreConfig,
}

impl ProjectServices {
    /// Validate `config` and build the stores for `root`.
    pub fn open(root: impl Into<PathBuf>, config: CoreConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let project = ProjectRoot::with_state_dir(root, config.state_dir_name.clone());
        debug!("Project state directory: {}", project.state_dir().display());

        let checkpoints = Arc::new(CheckpointManager::new(project.clone()));
        let patches = Arc::new(PatchSetStore::new(project.clone(), checkpoints.clone()));
        Ok(Arc::new(Self {
            project,
            patches,
            checkpoints,
            config,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = CoreConfig {
            max_iterations: 0,
            ..CoreConfig::default()
        };
        assert!(ProjectServices::open(temp_dir.path(), config).is_err());
    }

    #[test]
    fn test_open_uses_configured_state_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config = CoreConfig {
            state_dir_name: ".agent-state".to_string(),
            ..CoreConfig::default()
        };
        let services = ProjectServices::open(temp_dir.path(), config).unwrap();
        assert!(services.project.state_dir().ends_with(".agent-state"));
    }
}
