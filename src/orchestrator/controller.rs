//! The orchestration control loop.
//!
//! One run alternates model calls and tool rounds until the model stops
//! asking for tools, then optionally runs a verify phase with a reduced tool
//! set. Both phases are bounded; hitting a bound ends the run with a
//! [`StopReason`] rather than an error.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::context::{ContextProvider, NoContext, ProjectOverview};
use super::model::{ChatMessage, ModelClient, ModelError, ModelRequest};
use super::state::{NodeId, OrchestrationState, StopReason, Transition};
use crate::config::CoreConfig;
use crate::error::{ConfigError, RegistryError};
use crate::scheduler::ToolScheduler;
use crate::services::ProjectServices;
use crate::tools::{
    builtin_registry, verify_registry, CommandAllowlist, InvocationDefaults, Mode, ToolRegistry,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a coding agent working inside a software project.

Use the tools to inspect and change files. Paths are relative to the project root.
Guidelines:
- Read a file before changing it
- Prefer replace_in_file for small edits and write_file for whole files
- Every applied change is checkpointed; restore_checkpoint undoes it
- In propose mode changes are staged in a patch set for review instead of written
- When the task is complete, reply with a short summary and no tool calls"#;

/// Instructions given to the model when the verify phase starts.
pub fn verify_prompt(allowlist: &CommandAllowlist) -> String {
    let prefixes = allowlist
        .prefixes()
        .iter()
        .map(|p| format!("`{}`", p.trim_end()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Now verify the work. Only read-only tools and run_command are available, and \
         run_command only accepts commands starting with one of: {}. \
         Reply without tool calls once verification is done.",
        prefixes
    )
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model calls allowed in the primary phase. The verify phase is
    /// bounded by `max_verify_iterations` alone.
    pub max_iterations: usize,
    /// Verify tool rounds allowed (0 skips the verify phase)
    pub max_verify_iterations: usize,
    pub default_mode: Mode,
    /// Uses [`DEFAULT_SYSTEM_PROMPT`] when `None`
    pub system_prompt: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_core(&CoreConfig::default())
    }
}

impl OrchestratorConfig {
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_verify_iterations: config.max_verify_iterations,
            default_mode: config.default_mode,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Model call {iteration} failed: {source}")]
    Model {
        iteration: usize,
        #[source]
        source: ModelError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One task for the loop.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task: String,
    /// Overrides the configured default mode
    pub mode: Option<Mode>,
    /// Scopes the default patch set; a fresh id is generated when absent
    pub conversation_id: Option<String>,
}

impl RunRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            mode: None,
            conversation_id: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Result of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Last non-empty assistant text
    pub final_response: String,
    /// Model calls made
    pub iterations: usize,
    /// Verify tool rounds executed
    pub verify_iterations: usize,
    pub tool_calls_made: usize,
    pub stop_reason: StopReason,
    pub conversation_id: String,
    /// Patch set receiving propose-mode changes that named no patch set
    pub patch_set_id: String,
    /// Full conversation, including system and user messages
    pub messages: Vec<ChatMessage>,
}

struct VerifyPhase {
    tools: ToolRegistry,
    prompt: String,
}

pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    scheduler: Arc<ToolScheduler>,
    tools: ToolRegistry,
    verify: Option<VerifyPhase>,
    context: Arc<dyn ContextProvider>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        scheduler: Arc<ToolScheduler>,
        tools: ToolRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            model,
            scheduler,
            tools,
            verify: None,
            context: Arc::new(NoContext),
            config,
        }
    }

    /// Full stack for a project: built-in tools, the allowlisted verify
    /// set and a project overview as context.
    pub fn for_project(
        services: &Arc<ProjectServices>,
        model: Arc<dyn ModelClient>,
        scheduler: Arc<ToolScheduler>,
    ) -> Result<Self, OrchestratorError> {
        let core = &services.config;
        let tools = builtin_registry(services)?;

        let mut orchestrator = Self::new(
            model,
            scheduler,
            tools,
            OrchestratorConfig::from_core(core),
        )
        .with_context(Arc::new(ProjectOverview::new(services.project.clone())));

        if core.max_verify_iterations > 0 {
            let allowlist = CommandAllowlist::new(core.verify_allowlist.clone())?
                .with_chaining_denied(core.deny_command_chaining);
            let prompt = verify_prompt(&allowlist);
            let verify_tools = verify_registry(&orchestrator.tools, allowlist)?;
            orchestrator = orchestrator.with_verify_phase(verify_tools, prompt);
        }
        Ok(orchestrator)
    }

    pub fn with_verify_phase(mut self, tools: ToolRegistry, prompt: impl Into<String>) -> Self {
        self.verify = Some(VerifyPhase {
            tools,
            prompt: prompt.into(),
        });
        self
    }

    pub fn with_context(mut self, context: Arc<dyn ContextProvider>) -> Self {
        self.context = context;
        self
    }

    pub fn scheduler(&self) -> &Arc<ToolScheduler> {
        &self.scheduler
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run the loop for `request`, handing every assistant and tool message
    /// to `on_message` as it is produced.
    pub async fn run<F>(
        &self,
        request: RunRequest,
        mut on_message: F,
    ) -> Result<RunOutcome, OrchestratorError>
    where
        F: FnMut(&ChatMessage) + Send,
    {
        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mode = request.mode.unwrap_or(self.config.default_mode);
        let defaults = InvocationDefaults::new(mode, conversation_id.clone());

        let root_span = info_span!(
            "orchestration_run",
            conversation_id = %conversation_id,
            mode = mode.as_str()
        );

        async {
            info!("🚀 Starting run ({} mode)", mode.as_str());

            let mut messages = vec![ChatMessage::system(
                self.config
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            )];
            let context = self.context.context_lines(&request.task).await;
            if !context.is_empty() {
                messages.push(ChatMessage::system(format!(
                    "Project context:\n{}",
                    context.join("\n")
                )));
            }
            messages.push(ChatMessage::user(request.task.clone()));

            let mut state = OrchestrationState::new(messages);
            let stop_reason = loop {
                let transition = match state.node {
                    NodeId::Normal | NodeId::Verify => {
                        self.model_turn(&mut state, &mut on_message).await?
                    }
                    NodeId::ToolExecution | NodeId::VerifyToolExecution => {
                        self.tool_round(&mut state, &defaults, &mut on_message)
                            .await
                    }
                };
                match transition {
                    Transition::Next(node) => {
                        debug!("{:?} -> {:?}", state.node, node);
                        state.node = node;
                    }
                    Transition::End(reason) => break reason,
                }
            };

            info!(
                iterations = state.iterations,
                verify_iterations = state.verify_iterations,
                tool_calls = state.tool_calls_made,
                "✅ Run finished: {:?}",
                stop_reason
            );

            Ok(RunOutcome {
                final_response: state.final_response,
                iterations: state.iterations,
                verify_iterations: state.verify_iterations,
                tool_calls_made: state.tool_calls_made,
                stop_reason,
                conversation_id: conversation_id.clone(),
                patch_set_id: defaults.default_patch_set_id(),
                messages: state.messages,
            })
        }
        .instrument(root_span)
        .await
    }

    fn tools_for(&self, node: NodeId) -> &ToolRegistry {
        match &self.verify {
            Some(verify) if node.is_verify() => &verify.tools,
            _ => &self.tools,
        }
    }

    async fn model_turn(
        &self,
        state: &mut OrchestrationState,
        on_message: &mut (dyn FnMut(&ChatMessage) + Send),
    ) -> Result<Transition, OrchestratorError> {
        let in_verify = state.node.is_verify();
        // Verify calls happen after every primary call, so `iterations` is
        // the primary count whenever this check applies
        if !in_verify && state.iterations >= self.config.max_iterations {
            warn!(
                iterations = state.iterations,
                "Iteration limit reached; stopping"
            );
            return Ok(Transition::End(StopReason::IterationLimit));
        }
        state.iterations += 1;
        let iteration = state.iterations;

        let request = ModelRequest {
            messages: state.messages.clone(),
            tools: self.tools_for(state.node).definitions(),
        };
        let llm_span = info_span!(
            "model_call",
            iteration,
            phase = if in_verify { "verify" } else { "primary" }
        );
        let response = self
            .model
            .complete(&request)
            .instrument(llm_span)
            .await
            .map_err(|source| OrchestratorError::Model { iteration, source })?;

        debug!(
            "Model call {} returned {} tool call(s)",
            iteration,
            response.tool_calls.len()
        );
        if !response.content.trim().is_empty() {
            state.final_response = response.content.clone();
        }
        let message = ChatMessage::assistant(response.content, response.tool_calls);
        on_message(&message);
        state.pending_calls = message.tool_calls.clone();
        state.messages.push(message);

        if !state.pending_calls.is_empty() {
            let next = if in_verify {
                NodeId::VerifyToolExecution
            } else {
                NodeId::ToolExecution
            };
            return Ok(Transition::Next(next));
        }

        match &self.verify {
            Some(verify) if !in_verify && self.config.max_verify_iterations > 0 => {
                info!("🔍 Entering verify phase");
                state.messages.push(ChatMessage::user(verify.prompt.clone()));
                Ok(Transition::Next(NodeId::Verify))
            }
            _ => Ok(Transition::End(StopReason::Completed)),
        }
    }

    async fn tool_round(
        &self,
        state: &mut OrchestrationState,
        defaults: &InvocationDefaults,
        on_message: &mut (dyn FnMut(&ChatMessage) + Send),
    ) -> Transition {
        let calls = std::mem::take(&mut state.pending_calls);
        state.tool_calls_made += calls.len();
        for call in &calls {
            info!("🔧 {} ({})", call.name, call.id);
        }

        let results = self
            .scheduler
            .execute_batch_with(calls, self.tools_for(state.node), defaults)
            .await;
        for result in &results {
            if result.is_error() {
                debug!("{} failed: {}", result.tool_name, result.content);
            }
            let message = ChatMessage::tool_result(result);
            on_message(&message);
            state.messages.push(message);
        }

        if state.node != NodeId::VerifyToolExecution {
            return Transition::Next(NodeId::Normal);
        }
        state.verify_iterations += 1;
        if state.verify_iterations >= self.config.max_verify_iterations {
            warn!(
                verify_iterations = state.verify_iterations,
                "Verify limit reached; stopping"
            );
            return Transition::End(StopReason::VerifyLimit);
        }
        Transition::Next(NodeId::Verify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::orchestrator::model::{ModelResponse, Role};
    use crate::services::ProjectServices;
    use crate::tools::ToolCall;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays scripted responses, then repeats `fallback` forever.
    struct ScriptedModel {
        script: Mutex<VecDeque<ModelResponse>>,
        fallback: Option<ModelResponse>,
        offered: Mutex<Vec<Vec<String>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(script: Vec<ModelResponse>, fallback: Option<ModelResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                offered: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            self.offered
                .lock()
                .unwrap()
                .push(request.tools.iter().map(|t| t.name.clone()).collect());

            let next = self.script.lock().unwrap().pop_front();
            let mut response = next
                .or_else(|| self.fallback.clone())
                .ok_or_else(|| ModelError::Unavailable("script exhausted".to_string()))?;
            response.tool_calls = response
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(i, call)| call.with_id(format!("call-{}-{}", n, i)))
                .collect();
            Ok(response)
        }
    }

    fn services(temp_dir: &TempDir, configure: impl FnOnce(&mut CoreConfig)) -> Arc<ProjectServices> {
        let mut config = CoreConfig::default();
        configure(&mut config);
        ProjectServices::open(temp_dir.path(), config).unwrap()
    }

    fn orchestrator(services: &Arc<ProjectServices>, model: Arc<ScriptedModel>) -> Orchestrator {
        let scheduler = Arc::new(ToolScheduler::new(
            services.project.clone(),
            Arc::new(NullEventSink),
        ));
        Orchestrator::for_project(services, model, scheduler).unwrap()
    }

    fn write_call(path: &str, content: &str) -> ToolCall {
        ToolCall::new("write_file", json!({ "path": path, "content": content }))
    }

    fn run_command(command: &str) -> ModelResponse {
        ModelResponse::with_tool_calls(vec![ToolCall::new(
            "run_command",
            json!({ "command": command }),
        )])
    }

    #[tokio::test]
    async fn test_plain_answer_completes() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| c.max_verify_iterations = 0);
        let model = ScriptedModel::new(vec![ModelResponse::text("nothing to do")], None);

        let mut seen = Vec::new();
        let outcome = orchestrator(&services, model)
            .run(RunRequest::new("say hi"), |m| seen.push(m.clone()))
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.final_response, "nothing to do");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].role, Role::Assistant);
        assert_eq!(outcome.messages.last().unwrap().content, "nothing to do");
    }

    #[tokio::test]
    async fn test_tool_round_applies_and_reports_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| c.max_verify_iterations = 0);
        let model = ScriptedModel::new(
            vec![
                ModelResponse::with_tool_calls(vec![
                    write_call("a.txt", "one"),
                    write_call("b.txt", "two"),
                ]),
                ModelResponse::text("done"),
            ],
            None,
        );

        let mut roles = Vec::new();
        let outcome = orchestrator(&services, model)
            .run(RunRequest::new("write files"), |m| roles.push(m.role))
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.tool_calls_made, 2);
        assert_eq!(
            roles,
            vec![Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        assert_eq!(std::fs::read_to_string(temp_dir.path().join("a.txt")).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(temp_dir.path().join("b.txt")).unwrap(), "two");

        let tool_ids: Vec<_> = outcome
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(tool_ids, vec!["call-1-0", "call-1-1"]);
    }

    #[tokio::test]
    async fn test_propose_mode_stages_into_conversation_patch_set() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| c.max_verify_iterations = 0);
        let model = ScriptedModel::new(
            vec![
                ModelResponse::with_tool_calls(vec![write_call("a.txt", "staged")]),
                ModelResponse::text("proposed"),
            ],
            None,
        );

        let outcome = orchestrator(&services, model)
            .run(
                RunRequest::new("propose").with_mode(Mode::Propose),
                |_| {},
            )
            .await
            .unwrap();

        assert!(!temp_dir.path().join("a.txt").exists());
        let manifest = services
            .patches
            .load_manifest(&outcome.patch_set_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].relative_path, "a.txt");
    }

    #[tokio::test]
    async fn test_iteration_limit_stops_without_error() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| c.max_iterations = 3);
        let model = ScriptedModel::new(
            vec![],
            Some(ModelResponse::with_tool_calls(vec![ToolCall::new(
                "list_files",
                json!({}),
            )])),
        );

        let outcome = orchestrator(&services, model)
            .run(RunRequest::new("loop forever"), |_| {})
            .await
            .unwrap();

        // Verify is enabled by default but never starts on unfinished work
        assert!(services.config.max_verify_iterations > 0);
        assert_eq!(outcome.stop_reason, StopReason::IterationLimit);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.tool_calls_made, 3);
        assert_eq!(outcome.verify_iterations, 0);
    }

    #[tokio::test]
    async fn test_verify_rounds_are_not_cut_by_primary_budget() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| {
            c.max_iterations = 4;
            c.max_verify_iterations = 3;
            c.verify_allowlist = vec!["echo ".to_string()];
        });
        let list = || {
            ModelResponse::with_tool_calls(vec![ToolCall::new("list_files", json!({}))])
        };
        let model = ScriptedModel::new(
            vec![list(), list(), list(), ModelResponse::text("primary work done")],
            Some(run_command("echo hi")),
        );

        let outcome = orchestrator(&services, model)
            .run(RunRequest::new("task"), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::VerifyLimit);
        assert_eq!(outcome.verify_iterations, 3);
        assert_eq!(outcome.iterations, 7);
        assert_eq!(outcome.tool_calls_made, 6);
    }

    #[tokio::test]
    async fn test_verify_phase_runs_exactly_n_rounds() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| {
            c.max_verify_iterations = 2;
            c.verify_allowlist = vec!["xcodebuild ".to_string()];
        });
        let model = ScriptedModel::new(
            vec![ModelResponse::text("primary work done")],
            Some(run_command("rm -rf /tmp/x")),
        );

        let mut tool_messages = Vec::new();
        let outcome = orchestrator(&services, model.clone())
            .run(RunRequest::new("task"), |m| {
                if m.role == Role::Tool {
                    tool_messages.push(m.content.clone());
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::VerifyLimit);
        assert_eq!(outcome.verify_iterations, 2);
        // one primary call plus one per verify round
        assert_eq!(outcome.iterations, 3);
        assert_eq!(tool_messages.len(), 2);
        assert!(tool_messages.iter().all(|c| c.contains("not allowlisted")));

        let offered = model.offered.lock().unwrap();
        assert!(offered[0].contains(&"write_file".to_string()));
        assert!(!offered[1].contains(&"write_file".to_string()));
        assert!(offered[1].contains(&"run_command".to_string()));
        assert!(offered[1].contains(&"read_file".to_string()));
    }

    #[tokio::test]
    async fn test_verify_runs_allowlisted_command() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| {
            c.max_verify_iterations = 3;
            c.verify_allowlist = vec!["echo ".to_string()];
        });
        let model = ScriptedModel::new(
            vec![
                ModelResponse::text("primary work done"),
                run_command("echo verified"),
                ModelResponse::text("all good"),
            ],
            None,
        );

        let outcome = orchestrator(&services, model)
            .run(RunRequest::new("task"), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.verify_iterations, 1);
        assert_eq!(outcome.final_response, "all good");
        let tool_output = outcome
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_output.content.contains("Exit code: 0"));
        assert!(tool_output.content.contains("verified"));
    }

    #[tokio::test]
    async fn test_model_failure_is_the_only_error() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| c.max_verify_iterations = 0);
        let model = ScriptedModel::new(vec![], None);

        let err = orchestrator(&services, model)
            .run(RunRequest::new("task"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Model { iteration: 1, .. }));
    }

    #[tokio::test]
    async fn test_context_lines_are_sent_first() {
        let temp_dir = TempDir::new().unwrap();
        let services = services(&temp_dir, |c| c.max_verify_iterations = 0);
        let model = ScriptedModel::new(vec![ModelResponse::text("ok")], None);
        let provider = |_: &str| vec!["index says: lib.rs defines run()".to_string()];

        let outcome = orchestrator(&services, model)
            .with_context(Arc::new(provider))
            .run(RunRequest::new("task"), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.messages[0].role, Role::System);
        assert!(outcome.messages[1].content.contains("index says"));
        assert_eq!(outcome.messages[2].content, "task");
    }

    #[test]
    fn test_verify_prompt_lists_prefixes() {
        let allowlist =
            CommandAllowlist::new(vec!["cargo test".to_string(), "xcodebuild ".to_string()])
                .unwrap();
        let prompt = verify_prompt(&allowlist);
        assert!(prompt.contains("`cargo test`, `xcodebuild`"));
    }
}
