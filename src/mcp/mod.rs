//! MCP (Model Context Protocol) server implementation using rmcp.
//!
//! Serves the built-in tool registry over stdio. Calls are scheduled exactly
//! like the control loop's, so a client gets the same per-file ordering,
//! propose/apply modes and checkpoints.

mod handlers;
mod server;

pub use handlers::run_mcp_server;
pub use server::PatchloopMcpServer;
