//! Orchestration control loop and the model boundary.
//!
//! ```text
//! task → Orchestrator::run → ModelClient::complete (with tool definitions)
//!             ↓
//!        tool calls → ToolScheduler::execute_batch → results appended
//!             ↓
//!        no more calls → verify phase (read-only tools + allowlisted shell)
//!             ↓
//!        RunOutcome { stop_reason, .. }
//! ```

pub mod context;
pub mod controller;
mod http;
pub mod model;
pub mod ollama;
pub mod state;

pub use context::{ContextProvider, NoContext, ProjectOverview};
pub use controller::{
    verify_prompt, Orchestrator, OrchestratorConfig, OrchestratorError, RunOutcome, RunRequest,
    DEFAULT_SYSTEM_PROMPT,
};
pub use model::{ChatMessage, ModelClient, ModelError, ModelRequest, ModelResponse, Role};
pub use ollama::OllamaChatModel;
pub use state::{NodeId, OrchestrationState, StopReason, Transition};
