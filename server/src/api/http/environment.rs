//! Environment HTTP handlers

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::request_token;
use crate::domain::endpoint::EndpointMappings;
use crate::domain::environment::Environment;
use crate::domain::revision::Revision;
use crate::service::{EnvironmentUpdate, ExecRequest};
use crate::{AppState, Result};

/// Create environment request
#[derive(Debug, Deserialize)]
pub struct CreateEnvironmentRequest {
    #[serde(default)]
    pub explanation: String,
    pub source: PathBuf,
    pub name: String,
}

/// Open environment request
#[derive(Debug, Deserialize)]
pub struct OpenEnvironmentRequest {
    #[serde(default)]
    pub explanation: String,
    pub source: PathBuf,
    pub id: String,
}

/// Update environment request
#[derive(Debug, Deserialize)]
pub struct UpdateEnvironmentRequest {
    #[serde(default)]
    pub explanation: String,
    #[serde(flatten)]
    pub config: EnvironmentUpdate,
}

/// Run command request
#[derive(Debug, Deserialize)]
pub struct RunCommandRequest {
    #[serde(default)]
    pub explanation: String,
    #[serde(flatten)]
    pub exec: ExecRequest,
}

/// Background command request
#[derive(Debug, Deserialize)]
pub struct RunBackgroundRequest {
    #[serde(default)]
    pub explanation: String,
    #[serde(flatten)]
    pub exec: ExecRequest,
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Set environment variables request
#[derive(Debug, Deserialize)]
pub struct SetEnvRequest {
    #[serde(default)]
    pub explanation: String,
    pub envs: Vec<String>,
}

/// Revert request
#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    #[serde(default)]
    pub explanation: String,
    pub version: u64,
}

/// Fork request
#[derive(Debug, Deserialize)]
pub struct ForkRequest {
    #[serde(default)]
    pub explanation: String,
    pub name: String,
    pub version: Option<u64>,
}

/// Checkpoint request
#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub target: String,
}

/// Environment response
#[derive(Debug, Serialize)]
pub struct EnvironmentResponse {
    pub id: String,
    pub name: String,
    pub source: String,
    pub instructions: String,
    pub workdir: String,
    pub base_image: String,
    pub setup_commands: Vec<String>,
    pub secrets: Vec<String>,
    pub version: u64,
}

impl EnvironmentResponse {
    async fn from_env(env: &Environment) -> Self {
        let config = env.config().await;
        let version = env.history().await.latest_version().0;
        Self {
            id: env.id().to_string(),
            name: env.name().to_string(),
            source: env.source().to_string_lossy().into_owned(),
            instructions: config.instructions,
            workdir: config.workdir,
            base_image: config.base_image,
            setup_commands: config.setup_commands,
            secrets: config.secrets,
            version,
        }
    }
}

/// List environments response
#[derive(Debug, Serialize)]
pub struct ListEnvironmentsResponse {
    pub environments: Vec<EnvironmentResponse>,
    pub total: usize,
}

/// History response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub revisions: Vec<Revision>,
}

/// Run command response
#[derive(Debug, Serialize)]
pub struct RunCommandResponse {
    pub output: String,
}

/// Background command response
#[derive(Debug, Serialize)]
pub struct RunBackgroundResponse {
    pub endpoints: EndpointMappings,
}

/// Checkpoint response
#[derive(Debug, Serialize)]
pub struct CheckpointResponse {
    pub reference: String,
}

/// Lock state response
#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub locked: bool,
    /// Whether this request changed the marker
    pub changed: bool,
}

async fn respond(env: Arc<Environment>) -> Json<EnvironmentResponse> {
    Json(EnvironmentResponse::from_env(&env).await)
}

/// Create a new environment
pub async fn create_environment(
    State(state): State<AppState>,
    Json(req): Json<CreateEnvironmentRequest>,
) -> Result<(StatusCode, Json<EnvironmentResponse>)> {
    let (cancel, _guard) = request_token();
    let env = state
        .environment_service
        .create(&req.explanation, &req.source, &req.name, &cancel)
        .await?;
    Ok((StatusCode::CREATED, respond(env).await))
}

/// Open an existing environment, creating it if nothing is persisted
pub async fn open_environment(
    State(state): State<AppState>,
    Json(req): Json<OpenEnvironmentRequest>,
) -> Result<Json<EnvironmentResponse>> {
    let (cancel, _guard) = request_token();
    let env = state
        .environment_service
        .open(&req.explanation, &req.source, &req.id, &cancel)
        .await?;
    Ok(respond(env).await)
}

/// List live environments
pub async fn list_environments(
    State(state): State<AppState>,
) -> Result<Json<ListEnvironmentsResponse>> {
    let mut environments = Vec::new();
    for env in state.environment_service.list() {
        environments.push(EnvironmentResponse::from_env(&env).await);
    }
    environments.sort_by(|a, b| a.id.cmp(&b.id));

    let total = environments.len();
    Ok(Json(ListEnvironmentsResponse {
        environments,
        total,
    }))
}

/// Get an environment by id or name
pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EnvironmentResponse>> {
    let env = state.environment_service.get(&id)?;
    Ok(respond(env).await)
}

/// Replace an environment's configuration
pub async fn update_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateEnvironmentRequest>,
) -> Result<Json<Revision>> {
    let (cancel, _guard) = request_token();
    let revision = state
        .environment_service
        .update(&id, &req.explanation, req.config, &cancel)
        .await?;
    Ok(Json(revision))
}

/// Delete an environment
pub async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let (cancel, _guard) = request_token();
    state.environment_service.delete(&id, &cancel).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get an environment's revisions
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>> {
    let revisions = state.environment_service.history(&id).await?;
    Ok(Json(HistoryResponse { revisions }))
}

/// Run a command and commit the result
pub async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RunCommandRequest>,
) -> Result<Json<RunCommandResponse>> {
    let (cancel, _guard) = request_token();
    let output = state
        .environment_service
        .run(&id, &req.explanation, &req.exec, &cancel)
        .await?;
    Ok(Json(RunCommandResponse { output }))
}

/// Start a background service
pub async fn run_background(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RunBackgroundRequest>,
) -> Result<Json<RunBackgroundResponse>> {
    let (cancel, _guard) = request_token();
    let endpoints = state
        .environment_service
        .run_background(&id, &req.explanation, &req.exec, &req.ports, &cancel)
        .await?;
    Ok(Json(RunBackgroundResponse { endpoints }))
}

/// Set environment variables
pub async fn set_env(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetEnvRequest>,
) -> Result<Json<Revision>> {
    let (cancel, _guard) = request_token();
    let revision = state
        .environment_service
        .set_env(&id, &req.explanation, &req.envs, &cancel)
        .await?;
    Ok(Json(revision))
}

/// Revert to an earlier revision
pub async fn revert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RevertRequest>,
) -> Result<Json<Revision>> {
    let (cancel, _guard) = request_token();
    let revision = state
        .environment_service
        .revert(&id, &req.explanation, req.version, &cancel)
        .await?;
    Ok(Json(revision))
}

/// Fork an environment
pub async fn fork(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ForkRequest>,
) -> Result<(StatusCode, Json<EnvironmentResponse>)> {
    let (cancel, _guard) = request_token();
    let env = state
        .environment_service
        .fork(&id, &req.explanation, &req.name, req.version, &cancel)
        .await?;
    Ok((StatusCode::CREATED, respond(env).await))
}

/// Publish the current state to an image registry
pub async fn checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CheckpointRequest>,
) -> Result<Json<CheckpointResponse>> {
    let (cancel, _guard) = request_token();
    let reference = state
        .environment_service
        .checkpoint(&id, &req.target, &cancel)
        .await?;
    Ok(Json(CheckpointResponse { reference }))
}

/// Query the advisory lock marker
pub async fn get_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LockResponse>> {
    let locked = state.environment_service.is_locked(&id).await?;
    Ok(Json(LockResponse {
        locked,
        changed: false,
    }))
}

/// Take the advisory lock marker
pub async fn acquire_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LockResponse>> {
    let changed = state.environment_service.lock(&id).await?;
    Ok(Json(LockResponse {
        locked: true,
        changed,
    }))
}

/// Drop the advisory lock marker
pub async fn release_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LockResponse>> {
    let changed = state.environment_service.unlock(&id).await?;
    Ok(Json(LockResponse {
        locked: false,
        changed,
    }))
}
