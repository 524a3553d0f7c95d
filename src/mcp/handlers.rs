//! MCP server startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::services::ProjectServices;

use super::server::PatchloopMcpServer;

/// Run the MCP server over stdio until the client disconnects.
pub async fn run_mcp_server(services: Arc<ProjectServices>) -> Result<()> {
    info!("🔧 Starting Patchloop MCP Tool Server...");
    info!("📝 Stdio mode (using rmcp)");
    info!("📁 Project root: {}", services.project.canonical().display());

    let server =
        PatchloopMcpServer::new(services).context("Failed to register built-in tools")?;

    run_server(server).await
}

async fn run_server(server: PatchloopMcpServer) -> Result<()> {
    use rmcp::{transport::stdio, ServiceExt};

    info!("✅ MCP tool server started");
    info!("🔗 Ready for MCP client connections");

    let service = server.serve(stdio()).await.map_err(|e| {
        error!("Failed to start MCP service: {:?}", e);
        anyhow::anyhow!("Failed to start MCP service: {:?}", e)
    })?;

    service.waiting().await.map_err(|e| {
        error!("MCP service error: {:?}", e);
        anyhow::anyhow!("MCP service error: {:?}", e)
    })?;

    info!("MCP server shutting down");
    Ok(())
}
