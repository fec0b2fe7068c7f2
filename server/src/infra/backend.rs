//! Container backend capability
//!
//! Every method takes an existing state and returns a new one; states are
//! never mutated in place, so any handle stays valid for as long as the
//! backend keeps it.

use std::path::Path;

use async_trait::async_trait;

use crate::domain::container::{
    ContainerHandle, ContainerId, ContainerRef, ExecOptions, ExecOutput, ServiceHandle,
};
use crate::error::Result;

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Start a new state from an image reference
    async fn from_image(&self, image: &str) -> Result<ContainerHandle>;

    async fn with_workdir(&self, container: &ContainerHandle, workdir: &str)
        -> Result<ContainerHandle>;

    /// Expose a secret, resolved from `secret_ref`, as an environment variable
    async fn with_secret_variable(
        &self,
        container: &ContainerHandle,
        name: &str,
        secret_ref: &str,
    ) -> Result<ContainerHandle>;

    async fn with_env_variable(
        &self,
        container: &ContainerHandle,
        name: &str,
        value: &str,
    ) -> Result<ContainerHandle>;

    /// Copy a host directory to `path` (relative paths resolve against the workdir)
    async fn with_directory(
        &self,
        container: &ContainerHandle,
        path: &str,
        source: &Path,
    ) -> Result<ContainerHandle>;

    /// Run `args` on top of `container`
    ///
    /// `Err` means the exec could not run at all; a non-zero exit is reported
    /// through [`ExecOutput::exit_code`].
    async fn with_exec(
        &self,
        container: &ContainerHandle,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ExecOutput>;

    async fn with_exposed_port(&self, container: &ContainerHandle, port: u16)
        -> Result<ContainerHandle>;

    /// Start `container` as a long-lived service
    ///
    /// A command that exits non-zero during startup yields
    /// `Error::CommandFailed`.
    async fn start_service(
        &self,
        container: &ContainerHandle,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ServiceHandle>;

    /// Force the state to be fully realized
    async fn sync(&self, container: &ContainerHandle) -> Result<()>;

    /// Durable identifier of a state
    async fn id(&self, container: &ContainerHandle) -> Result<ContainerId>;

    /// Resolve a durable identifier back into a live handle
    async fn load(&self, id: &ContainerId) -> Result<ContainerHandle>;

    /// Publish a state to an image registry, returning the pushed reference
    async fn publish(&self, container: &ContainerHandle, target: &str) -> Result<String>;

    /// Attach an interactive terminal to a state
    async fn terminal(&self, container: &ContainerHandle) -> Result<()>;
}

/// Turn a revision's container reference into a live handle
pub async fn resolve(
    backend: &dyn ContainerBackend,
    container: &ContainerRef,
) -> Result<ContainerHandle> {
    match container {
        ContainerRef::Live(handle) => Ok(handle.clone()),
        ContainerRef::Reference(id) => backend.load(id).await,
    }
}

/// Arguments for running `command` through `shell`; empty means the default entrypoint
pub fn shell_args(command: &str, shell: &str) -> Vec<String> {
    if command.is_empty() {
        Vec::new()
    } else {
        vec![shell.to_string(), "-c".to_string(), command.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_args() {
        assert_eq!(shell_args("ls -la", "bash"), vec!["bash", "-c", "ls -la"]);
        assert!(shell_args("", "sh").is_empty());
    }
}
