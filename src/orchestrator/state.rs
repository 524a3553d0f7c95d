use serde::Serialize;

use super::model::ChatMessage;
use crate::tools::ToolCall;

/// Position in the control loop.
///
/// ```text
/// Normal -> ToolExecution -> Normal ... -> Verify -> VerifyToolExecution -> Verify ... -> End
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Normal,
    ToolExecution,
    Verify,
    VerifyToolExecution,
}

impl NodeId {
    pub fn is_verify(&self) -> bool {
        matches!(self, NodeId::Verify | NodeId::VerifyToolExecution)
    }
}

/// Why a run ended. Hitting a cap is a normal ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model stopped requesting tools.
    Completed,
    /// `max_iterations` primary-phase model calls were made. The verify
    /// phase is skipped since the primary work never finished.
    IterationLimit,
    /// `max_verify_iterations` verify rounds were executed.
    VerifyLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Next(NodeId),
    End(StopReason),
}

/// Mutable state threaded through one run.
#[derive(Debug, Clone)]
pub struct OrchestrationState {
    pub node: NodeId,
    pub messages: Vec<ChatMessage>,
    /// Calls requested by the last model turn, waiting for execution.
    pub pending_calls: Vec<ToolCall>,
    /// Model calls made, across both phases.
    pub iterations: usize,
    /// Verify tool rounds executed.
    pub verify_iterations: usize,
    pub tool_calls_made: usize,
    /// Last non-empty assistant text.
    pub final_response: String,
}

impl OrchestrationState {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            node: NodeId::Normal,
            messages,
            pending_calls: Vec::new(),
            iterations: 0,
            verify_iterations: 0,
            tool_calls_made: 0,
            final_response: String::new(),
        }
    }
}
