//! MCP Client Test
//!
//! Spawns the environment server in stdio mode with the in-memory backend
//! and walks through the environment tools.

use anyhow::{bail, Result};
use rmcp::{
    model::CallToolRequestParam,
    transport::{ConfigureCommandExt, TokioChildProcess},
    ServiceExt,
};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Helper to call a tool and print the result
async fn call_tool(
    client: &rmcp::service::RunningService<rmcp::service::RoleClient, ()>,
    name: &str,
    args: Value,
) -> Result<String> {
    info!("📤 Calling tool: {}", name);
    info!("   Arguments: {}", serde_json::to_string_pretty(&args)?);

    let result = client
        .call_tool(CallToolRequestParam {
            name: name.to_string().into(),
            arguments: args.as_object().cloned(),
        })
        .await?;

    let content = result
        .content
        .first()
        .and_then(|c| c.raw.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_else(|| "No content".into());

    if result.is_error.unwrap_or(false) {
        error!("❌ Tool error: {}", content);
    } else {
        info!("✅ Result:\n{}", content);
    }

    Ok(content)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("🚀 Starting MCP Client Test");
    info!("================================");

    // Get the path to the server binary
    let server_path = std::env::var("MCP_SERVER_PATH")
        .unwrap_or_else(|_| "../../target/debug/environment-server".to_string());

    // A throwaway source tree for the environment
    let source = std::env::temp_dir().join(format!("mcp-test-{}", std::process::id()));
    std::fs::create_dir_all(&source)?;
    std::fs::write(source.join("README.md"), "hello from the source tree\n")?;
    let source = source.to_string_lossy().into_owned();

    info!("📡 Connecting to MCP server: {}", server_path);

    let transport = TokioChildProcess::new(Command::new(&server_path).configure(|cmd| {
        cmd.env("ENVIRONMENT_MCP_MODE", "stdio")
            .env("ENVIRONMENT_BACKEND", "memory")
            .env("ENVIRONMENT_TRACKER", "memory");
    }))?;

    let client = ().serve(transport).await?;
    info!("✅ Connected to MCP server");

    // ========================================================================
    // Test 1: List available tools
    // ========================================================================
    info!("📋 Test 1: List available tools");
    let tools = client.list_tools(None).await?;
    info!("Available tools ({}):", tools.tools.len());
    for tool in &tools.tools {
        info!("  - {} : {}", tool.name, tool.description.as_deref().unwrap_or(""));
    }

    // ========================================================================
    // Test 2: Create
    // ========================================================================
    info!("🏗️  Test 2: Create an environment");
    let created = call_tool(
        &client,
        "environment_create",
        json!({
            "explanation": "smoke test",
            "environment_source": source,
            "title": "smoke"
        }),
    )
    .await?;
    let created: Value = serde_json::from_str(&created)?;
    let Some(environment_id) = created["id"].as_str().map(str::to_string) else {
        bail!("environment_create returned no id");
    };
    info!("📦 Using environment: {}", environment_id);

    // ========================================================================
    // Test 3: Commands and variables
    // ========================================================================
    info!("⚙️  Test 3: Commands");
    call_tool(
        &client,
        "environment_run_cmd",
        json!({
            "environment_id": environment_id,
            "explanation": "write a file",
            "command": "echo generated > out.txt"
        }),
    )
    .await?;
    call_tool(
        &client,
        "environment_run_cmd",
        json!({
            "environment_id": environment_id,
            "explanation": "read it back",
            "command": "cat out.txt"
        }),
    )
    .await?;
    call_tool(
        &client,
        "environment_set_env",
        json!({
            "environment_id": environment_id,
            "explanation": "configure",
            "envs": ["MODE=test"]
        }),
    )
    .await?;
    call_tool(
        &client,
        "environment_run_cmd",
        json!({
            "environment_id": environment_id,
            "explanation": "serve",
            "command": "echo listening",
            "background": true,
            "ports": [8080]
        }),
    )
    .await?;

    // ========================================================================
    // Test 4: History
    // ========================================================================
    info!("🕘 Test 4: History");
    call_tool(
        &client,
        "environment_history",
        json!({ "environment_id": environment_id }),
    )
    .await?;
    call_tool(
        &client,
        "environment_revert",
        json!({
            "environment_id": environment_id,
            "explanation": "undo",
            "version": 1
        }),
    )
    .await?;
    call_tool(
        &client,
        "environment_fork",
        json!({
            "environment_id": environment_id,
            "explanation": "branch off",
            "name": "smoke-fork",
            "version": 2
        }),
    )
    .await?;
    call_tool(&client, "environment_list", json!({})).await?;

    // ========================================================================
    // Test 5: Cleanup
    // ========================================================================
    info!("🧹 Test 5: Cleanup");
    call_tool(
        &client,
        "environment_delete",
        json!({ "environment_id": environment_id }),
    )
    .await?;

    info!("================================");
    info!("✅ All MCP tests completed successfully!");
    info!("================================");

    client.cancel().await?;
    std::fs::remove_dir_all(&source).ok();

    Ok(())
}
