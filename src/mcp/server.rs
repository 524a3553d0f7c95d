//! MCP server implementation.
//!
//! Tools come from the runtime [`ToolRegistry`], so listing and dispatch are
//! implemented by hand instead of through a static tool router. Every call
//! goes through the shared [`ToolScheduler`], which gives concurrent clients
//! the same per-key ordering as the control loop.

use std::sync::Arc;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, Implementation, JsonObject,
        ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
        Tool as McpTool,
    },
    service::RequestContext,
    ErrorData as McpError, RoleServer, ServerHandler,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::events::TracingEventSink;
use crate::scheduler::{ToolResultMessage, ToolScheduler};
use crate::services::ProjectServices;
use crate::tools::{builtin_registry, InvocationDefaults, ToolCall, ToolRegistry};

/// Patchloop MCP Server
#[derive(Clone)]
pub struct PatchloopMcpServer {
    services: Arc<ProjectServices>,
    tools: ToolRegistry,
    scheduler: Arc<ToolScheduler>,
}

impl PatchloopMcpServer {
    /// Server over the built-in tools of `services`. One conversation id is
    /// used for the whole session, so propose-mode calls without a
    /// `patch_set_id` share a patch set.
    pub fn new(services: Arc<ProjectServices>) -> Result<Self, RegistryError> {
        let tools = builtin_registry(&services)?;
        let defaults = InvocationDefaults::new(
            services.config.default_mode,
            format!("mcp-{}", uuid::Uuid::new_v4()),
        );
        let scheduler = ToolScheduler::new(services.project.clone(), Arc::new(TracingEventSink))
            .with_defaults(defaults);
        Ok(Self {
            services,
            tools,
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn services(&self) -> &Arc<ProjectServices> {
        &self.services
    }

    /// Registry tools in MCP form.
    pub fn tool_list(&self) -> Vec<McpTool> {
        self.tools
            .definitions()
            .into_iter()
            .map(|definition| {
                let schema = match definition.parameters {
                    Value::Object(map) => map,
                    _ => {
                        let mut map = JsonObject::new();
                        map.insert("type".to_string(), Value::String("object".to_string()));
                        map
                    }
                };
                McpTool::new(definition.name, definition.description, Arc::new(schema))
            })
            .collect()
    }

    /// Run one tool through the scheduler. `cancel` firing cancels the call.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        cancel: &CancellationToken,
    ) -> CallToolResult {
        let call = ToolCall::new(name, arguments.unwrap_or_default());
        let call_id = call.id.clone();
        info!("🔧 MCP tools/call {} ({})", name, call_id);

        let batch = self.scheduler.execute_batch(vec![call], &self.tools);
        tokio::pin!(batch);
        let results = tokio::select! {
            results = &mut batch => results,
            _ = cancel.cancelled() => {
                debug!("Client cancelled {}", call_id);
                self.scheduler.cancel(&call_id);
                batch.await
            }
        };

        match results.into_iter().next() {
            Some(result) => to_call_result(result),
            None => CallToolResult::error(vec![Content::text("Error: tool produced no result")]),
        }
    }
}

fn to_call_result(result: ToolResultMessage) -> CallToolResult {
    if result.is_error() {
        CallToolResult::error(vec![Content::text(result.content)])
    } else {
        CallToolResult::success(vec![Content::text(result.content)])
    }
}

impl ServerHandler for PatchloopMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "patchloop".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Patchloop MCP Server provides file tools with staged patch sets, checkpointed \
                 applies and a shell, scheduled so conflicting edits never race."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.tool_list()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self
            .dispatch(&request.name, request.arguments, &context.ct)
            .await)
    }
}
