//! MCP Server Handler implementation

use std::path::Path;
use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::types::*;
use crate::domain::environment::Environment;
use crate::service::{EnvironmentUpdate, ExecRequest};
use crate::AppState;

/// MCP Handler for environment operations
#[derive(Clone)]
pub struct EnvironmentMcpHandler {
    state: AppState,
    tool_router: ToolRouter<Self>,
}

impl EnvironmentMcpHandler {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }
}

async fn describe(env: &Arc<Environment>) -> serde_json::Value {
    let config = env.config().await;
    let history = env.history().await;
    serde_json::json!({
        "id": env.id(),
        "name": env.name(),
        "source": env.source(),
        "instructions": config.instructions,
        "base_image": config.base_image,
        "workdir": config.workdir,
        "setup_commands": config.setup_commands,
        "secrets": config.secrets,
        "version": history.latest_version(),
    })
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[tool_router]
impl EnvironmentMcpHandler {
    #[tool(description = "Create a new environment for a source repository. Returns the environment ID and its configuration. \
        Update the environment with a suitable base image and setup commands before running commands in it.")]
    async fn environment_create(
        &self,
        Parameters(params): Parameters<EnvironmentCreateParams>,
    ) -> String {
        info!("MCP: environment_create called for {}", params.title);
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .create(
                &params.explanation,
                Path::new(&params.environment_source),
                &params.title,
                &cancel,
            )
            .await
        {
            Ok(env) => pretty(&describe(&env).await),
            Err(e) => {
                error!("MCP: environment_create failed: {}", e);
                format!("Failed to create environment: {}", e)
            }
        }
    }

    #[tool(description = "Open an existing environment by ID, creating it if it does not exist.")]
    async fn environment_open(
        &self,
        Parameters(params): Parameters<EnvironmentOpenParams>,
    ) -> String {
        info!("MCP: environment_open called for {}", params.environment_id);
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .open(
                &params.explanation,
                Path::new(&params.environment_source),
                &params.environment_id,
                &cancel,
            )
            .await
        {
            Ok(env) => pretty(&describe(&env).await),
            Err(e) => {
                error!("MCP: environment_open failed: {}", e);
                format!("Failed to open environment: {}", e)
            }
        }
    }

    #[tool(description = "List the environments known to this server.")]
    async fn environment_list(
        &self,
        Parameters(_params): Parameters<EnvironmentListParams>,
    ) -> String {
        info!("MCP: environment_list called");

        let mut response = Vec::new();
        for env in self.state.environment_service.list() {
            response.push(describe(&env).await);
        }
        pretty(&response)
    }

    #[tool(description = "Replace an environment's instructions, base image, setup commands and secrets, then rebuild it. \
        Fails if a human has locked the environment.")]
    async fn environment_update(
        &self,
        Parameters(params): Parameters<EnvironmentUpdateParams>,
    ) -> String {
        info!("MCP: environment_update called for {}", params.environment_id);
        let cancel = CancellationToken::new();

        let update = EnvironmentUpdate {
            instructions: params.instructions,
            base_image: params.base_image,
            setup_commands: params.setup_commands,
            secrets: params.secrets,
        };
        match self
            .state
            .environment_service
            .update(&params.environment_id, &params.explanation, update, &cancel)
            .await
        {
            Ok(revision) => pretty(&revision),
            Err(e) => {
                error!("MCP: environment_update failed: {}", e);
                format!("Failed to update environment: {}", e)
            }
        }
    }

    #[tool(description = "Run a terminal command inside an environment. In the foreground the resulting filesystem \
        becomes a new revision and the output is returned, including failures. In the background the listed ports \
        are exposed and their internal and external endpoints returned.")]
    async fn environment_run_cmd(
        &self,
        Parameters(params): Parameters<EnvironmentRunCmdParams>,
    ) -> String {
        info!(
            "MCP: environment_run_cmd called in {} with command: {}",
            params.environment_id, params.command
        );
        let cancel = CancellationToken::new();
        let service = &self.state.environment_service;

        let request = ExecRequest {
            command: params.command,
            shell: params.shell,
            use_entrypoint: params.use_entrypoint,
        };

        if params.background {
            return match service
                .run_background(
                    &params.environment_id,
                    &params.explanation,
                    &request,
                    &params.ports,
                    &cancel,
                )
                .await
            {
                Ok(endpoints) => pretty(&endpoints),
                Err(e) => {
                    error!("MCP: environment_run_cmd (background) failed: {}", e);
                    format!("Failed to run command in background: {}", e)
                }
            };
        }

        match service
            .run(&params.environment_id, &params.explanation, &request, &cancel)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!("MCP: environment_run_cmd failed: {}", e);
                format!("Failed to run command: {}", e)
            }
        }
    }

    #[tool(description = "Set environment variables, given as KEY=VALUE, in one new revision.")]
    async fn environment_set_env(
        &self,
        Parameters(params): Parameters<EnvironmentSetEnvParams>,
    ) -> String {
        info!("MCP: environment_set_env called for {}", params.environment_id);
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .set_env(&params.environment_id, &params.explanation, &params.envs, &cancel)
            .await
        {
            Ok(revision) => pretty(&revision),
            Err(e) => {
                error!("MCP: environment_set_env failed: {}", e);
                format!("Failed to set environment variables: {}", e)
            }
        }
    }

    #[tool(description = "List the revisions of an environment, oldest first.")]
    async fn environment_history(
        &self,
        Parameters(params): Parameters<EnvironmentIdParams>,
    ) -> String {
        info!("MCP: environment_history called for {}", params.environment_id);

        match self
            .state
            .environment_service
            .history(&params.environment_id)
            .await
        {
            Ok(revisions) => pretty(&revisions),
            Err(e) => {
                error!("MCP: environment_history failed: {}", e);
                format!("Failed to get history: {}", e)
            }
        }
    }

    #[tool(description = "Restore the state of an earlier version as a new revision. History is never rewritten.")]
    async fn environment_revert(
        &self,
        Parameters(params): Parameters<EnvironmentRevertParams>,
    ) -> String {
        info!(
            "MCP: environment_revert called for {} to version {}",
            params.environment_id, params.version
        );
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .revert(&params.environment_id, &params.explanation, params.version, &cancel)
            .await
        {
            Ok(revision) => pretty(&revision),
            Err(e) => {
                error!("MCP: environment_revert failed: {}", e);
                format!("Failed to revert environment: {}", e)
            }
        }
    }

    #[tool(description = "Create a new environment starting from a version of an existing one (default: latest).")]
    async fn environment_fork(
        &self,
        Parameters(params): Parameters<EnvironmentForkParams>,
    ) -> String {
        info!("MCP: environment_fork called for {}", params.environment_id);
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .fork(
                &params.environment_id,
                &params.explanation,
                &params.name,
                params.version,
                &cancel,
            )
            .await
        {
            Ok(env) => pretty(&describe(&env).await),
            Err(e) => {
                error!("MCP: environment_fork failed: {}", e);
                format!("Failed to fork environment: {}", e)
            }
        }
    }

    #[tool(description = "Publish the current state of an environment as a container image.")]
    async fn environment_checkpoint(
        &self,
        Parameters(params): Parameters<EnvironmentCheckpointParams>,
    ) -> String {
        info!(
            "MCP: environment_checkpoint called for {} to {}",
            params.environment_id, params.destination
        );
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .checkpoint(&params.environment_id, &params.destination, &cancel)
            .await
        {
            Ok(reference) => reference,
            Err(e) => {
                error!("MCP: environment_checkpoint failed: {}", e);
                format!("Failed to checkpoint environment: {}", e)
            }
        }
    }

    #[tool(description = "Delete an environment and its stored state.")]
    async fn environment_delete(
        &self,
        Parameters(params): Parameters<EnvironmentIdParams>,
    ) -> String {
        info!("MCP: environment_delete called for {}", params.environment_id);
        let cancel = CancellationToken::new();

        match self
            .state
            .environment_service
            .delete(&params.environment_id, &cancel)
            .await
        {
            Ok(()) => format!("Environment {} deleted successfully", params.environment_id),
            Err(e) => {
                error!("MCP: environment_delete failed: {}", e);
                format!("Failed to delete environment: {}", e)
            }
        }
    }
}

#[tool_handler]
impl ServerHandler for EnvironmentMcpHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Environment MCP Server - Versioned, containerized sandboxes for source repositories. \
                Use environment_create or environment_open to start, environment_run_cmd to execute \
                commands, and environment_revert or environment_fork to move through history."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
