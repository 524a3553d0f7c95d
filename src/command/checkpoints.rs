use std::sync::Arc;

use anyhow::{Context, Result};

use patchloop::services::ProjectServices;

use crate::cli::CheckpointsAction;

pub async fn run_checkpoints(
    services: Arc<ProjectServices>,
    action: CheckpointsAction,
) -> Result<()> {
    match action {
        CheckpointsAction::List => {
            let checkpoints = services
                .checkpoints
                .list_checkpoints()
                .await
                .context("Failed to list checkpoints")?;
            if checkpoints.is_empty() {
                println!("No checkpoints.");
                return Ok(());
            }
            for checkpoint in checkpoints {
                println!(
                    "{}  {}  {} path(s){}",
                    checkpoint.checkpoint_id,
                    checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
                    checkpoint.entries.len(),
                    checkpoint
                        .label
                        .as_deref()
                        .map(|l| format!("  ({})", l))
                        .unwrap_or_default()
                );
            }
        }
        CheckpointsAction::Restore { checkpoint_id } => {
            let outcome = services
                .checkpoints
                .restore_checkpoint(&checkpoint_id)
                .await
                .with_context(|| format!("Failed to restore checkpoint {}", checkpoint_id))?;
            println!(
                "✅ Restored checkpoint {} ({} path(s), {} changed)",
                outcome.checkpoint_id,
                outcome.paths.len(),
                outcome.changes.len()
            );
            for change in &outcome.changes {
                println!("   {}", change.path());
            }
        }
    }
    Ok(())
}
