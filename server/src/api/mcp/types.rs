//! MCP Tool Parameter Types

use rmcp::schemars;
use serde::Deserialize;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentCreateParams {
    #[schemars(description = "One sentence explanation for why this environment is being created")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "Absolute path to the source git repository for the environment")]
    pub environment_source: String,

    #[schemars(description = "Short name describing the work done in this environment")]
    pub title: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentOpenParams {
    #[schemars(description = "One sentence explanation for why this environment is being opened")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "Absolute path to the source git repository for the environment")]
    pub environment_source: String,

    #[schemars(description = "The ID of the environment to open")]
    pub environment_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentListParams {}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentIdParams {
    #[schemars(description = "The ID of the environment")]
    pub environment_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentUpdateParams {
    #[schemars(description = "The ID of the environment to update")]
    pub environment_id: String,

    #[schemars(description = "One sentence explanation for why this environment is being updated")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "The instructions for the environment")]
    #[serde(default)]
    pub instructions: String,

    #[schemars(description = "Base image to start from, e.g. ubuntu:24.04 or golang:1.24")]
    pub base_image: String,

    #[schemars(description = "Commands run once when building the environment, e.g. package installs")]
    #[serde(default)]
    pub setup_commands: Vec<String>,

    #[schemars(description = "Secrets as KEY=ref, where ref is env://NAME or file://PATH")]
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentRunCmdParams {
    #[schemars(description = "The ID of the environment to run the command in")]
    pub environment_id: String,

    #[schemars(description = "One sentence explanation for why this command is being run")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "The terminal command to execute. If empty, the image's default command is used")]
    #[serde(default)]
    pub command: String,

    #[schemars(description = "The shell that will be interpreting this command (default: sh)")]
    pub shell: Option<String>,

    #[schemars(description = "Run the command in the background, e.g. for servers")]
    #[serde(default)]
    pub background: bool,

    #[schemars(description = "Ports to expose when running in the background")]
    #[serde(default)]
    pub ports: Vec<u16>,

    #[schemars(description = "Prepend the image entrypoint to the command")]
    #[serde(default)]
    pub use_entrypoint: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentSetEnvParams {
    #[schemars(description = "The ID of the environment")]
    pub environment_id: String,

    #[schemars(description = "One sentence explanation for why these variables are being set")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "Environment variables as KEY=VALUE")]
    pub envs: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentRevertParams {
    #[schemars(description = "The ID of the environment")]
    pub environment_id: String,

    #[schemars(description = "One sentence explanation for why the environment is being reverted")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "The version to revert to")]
    pub version: u64,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentForkParams {
    #[schemars(description = "The ID of the environment to fork")]
    pub environment_id: String,

    #[schemars(description = "One sentence explanation for why the environment is being forked")]
    #[serde(default)]
    pub explanation: String,

    #[schemars(description = "Name of the new environment")]
    pub name: String,

    #[schemars(description = "Version to fork from (default: latest)")]
    pub version: Option<u64>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EnvironmentCheckpointParams {
    #[schemars(description = "The ID of the environment")]
    pub environment_id: String,

    #[schemars(description = "Image reference to publish to, e.g. ghcr.io/me/app:checkpoint")]
    pub destination: String,
}
