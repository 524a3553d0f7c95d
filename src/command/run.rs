use std::sync::Arc;

use anyhow::{Context, Result};

use patchloop::events::TracingEventSink;
use patchloop::orchestrator::{
    ChatMessage, OllamaChatModel, Orchestrator, Role, RunRequest, StopReason,
};
use patchloop::scheduler::ToolScheduler;
use patchloop::services::ProjectServices;
use patchloop::tools::{Mode, ProgressSink};

use crate::cli::Cli;

/// Echoes shell output to stderr while a command runs.
struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, _tool_call_id: &str, chunk: &str) {
        eprint!("   │ {}", chunk);
        if !chunk.ends_with('\n') {
            eprintln!();
        }
    }
}

pub async fn run_task(
    services: Arc<ProjectServices>,
    cli: &Cli,
    task: String,
    conversation_id: Option<String>,
) -> Result<()> {
    let model = OllamaChatModel::new(&cli.ollama_url, cli.model.clone())
        .context("Invalid Ollama URL")?;
    println!("🤖 Model {} at {}", cli.model, model.endpoint());

    let scheduler = ToolScheduler::new(services.project.clone(), Arc::new(TracingEventSink))
        .with_progress(Arc::new(StderrProgress));
    let orchestrator =
        Orchestrator::for_project(&services, Arc::new(model), Arc::new(scheduler))?;

    let mut request = RunRequest::new(task);
    if let Some(id) = conversation_id {
        request = request.with_conversation_id(id);
    }

    let outcome = orchestrator.run(request, print_message).await?;

    println!();
    match outcome.stop_reason {
        StopReason::Completed => println!("✅ Done"),
        StopReason::IterationLimit => println!("⚠️  Stopped: model call limit reached"),
        StopReason::VerifyLimit => println!("⚠️  Stopped: verify round limit reached"),
    }
    println!(
        "   {} model call(s), {} tool call(s), {} verify round(s)",
        outcome.iterations, outcome.tool_calls_made, outcome.verify_iterations
    );
    println!("   Conversation: {}", outcome.conversation_id);

    if services.config.default_mode == Mode::Propose {
        let staged = services
            .patches
            .load_manifest(&outcome.patch_set_id)
            .await?
            .map(|m| m.entries.len())
            .unwrap_or(0);
        if staged > 0 {
            println!(
                "\n📦 {} change(s) staged in patch set {}",
                staged, outcome.patch_set_id
            );
            println!("   Review: patchloop patches show {}", outcome.patch_set_id);
            println!("   Apply:  patchloop patches apply {}", outcome.patch_set_id);
        }
    }
    Ok(())
}

fn print_message(message: &ChatMessage) {
    match message.role {
        Role::Assistant => {
            if !message.content.trim().is_empty() {
                println!("\n💬 {}", message.content.trim());
            }
            for call in &message.tool_calls {
                let target = call
                    .arguments
                    .str("path")
                    .or_else(|| call.arguments.str("command"))
                    .unwrap_or_default();
                println!("🔧 {} {}", call.name, target);
            }
        }
        Role::Tool => {
            let name = message.tool_name.as_deref().unwrap_or("tool");
            let first_line = message.content.lines().next().unwrap_or_default();
            println!("   {} → {}", name, first_line);
        }
        Role::System | Role::User => {}
    }
}
