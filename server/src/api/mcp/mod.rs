//! MCP (Model Context Protocol) API layer
//!
//! Exposes the environment operations as tools for AI assistants.

mod handler;
mod types;

pub use handler::EnvironmentMcpHandler;

use rmcp::transport::stdio;
use rmcp::ServiceExt;
use tracing::info;

use crate::AppState;

/// Start MCP server in stdio mode
pub async fn serve_stdio(state: AppState) -> anyhow::Result<()> {
    info!("Starting MCP server in stdio mode");

    let handler = EnvironmentMcpHandler::new(state);
    let service = handler.serve(stdio()).await?;

    info!("MCP server ready, waiting for requests...");
    service.waiting().await?;

    info!("MCP server shutdown");
    Ok(())
}
