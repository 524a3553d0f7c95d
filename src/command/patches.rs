use std::sync::Arc;

use anyhow::{Context, Result};

use patchloop::services::ProjectServices;

use crate::cli::PatchesAction;

pub async fn run_patches(services: Arc<ProjectServices>, action: PatchesAction) -> Result<()> {
    let patches = &services.patches;
    match action {
        PatchesAction::List => {
            let summaries = patches
                .list_patch_sets()
                .await
                .context("Failed to list patch sets")?;
            if summaries.is_empty() {
                println!("No patch sets.");
                return Ok(());
            }
            for summary in summaries {
                println!(
                    "{}  {} entr{}  updated {}",
                    summary.patch_set_id,
                    summary.entry_count,
                    if summary.entry_count == 1 { "y" } else { "ies" },
                    summary.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        PatchesAction::Show {
            patch_set_id,
            content,
        } => {
            let Some(manifest) = patches.load_manifest(&patch_set_id).await? else {
                anyhow::bail!("Patch set not found: {}", patch_set_id);
            };
            println!(
                "Patch set {} ({} entries)\n",
                manifest.patch_set_id,
                manifest.entries.len()
            );
            for entry in &manifest.entries {
                println!(
                    "{:<7} {}  [{}]",
                    entry.kind.as_str(),
                    entry.relative_path,
                    entry.tool_call_id
                );
                if content {
                    if let Some(text) = &entry.content {
                        for line in text.lines() {
                            println!("   │ {}", line);
                        }
                    }
                }
            }
        }
        PatchesAction::Apply { patch_set_id } => {
            let outcome = patches
                .apply_patch_set(&patch_set_id)
                .await
                .with_context(|| format!("Failed to apply patch set {}", patch_set_id))?;
            println!(
                "✅ Applied patch set {} ({} path(s))",
                patch_set_id,
                outcome.paths.len()
            );
            for change in &outcome.changes {
                println!("   {}", change.path());
            }
            if let Some(checkpoint_id) = outcome.checkpoint_id {
                println!("\nUndo with: patchloop checkpoints restore {}", checkpoint_id);
            }
        }
        PatchesAction::Clear { patch_set_id } => {
            if patches.clear_patch_set(&patch_set_id).await? {
                println!("✅ Cleared patch set {}", patch_set_id);
            } else {
                println!("Patch set {} does not exist.", patch_set_id);
            }
        }
    }
    Ok(())
}
