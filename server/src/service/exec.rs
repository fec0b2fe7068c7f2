//! Command execution and environment variables

use std::collections::BTreeSet;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::apply::{cancellable, Commit};
use super::environment::EnvironmentService;
use crate::domain::container::{ExecOptions, PortForward};
use crate::domain::endpoint::{EndpointMapping, EndpointMappings};
use crate::domain::environment::parse_assignments;
use crate::domain::revision::Revision;
use crate::error::{Error, Result};
use crate::infra::backend::shell_args;

/// A command to run inside an environment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecRequest {
    /// Empty runs the image's default entrypoint
    #[serde(default)]
    pub command: String,
    /// Defaults to the configured shell
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub use_entrypoint: bool,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

impl EnvironmentService {
    fn exec_args(&self, request: &ExecRequest) -> Vec<String> {
        let shell = request.shell.as_deref().unwrap_or(&self.config.shell);
        shell_args(&request.command, shell)
    }

    /// Run a command and commit the resulting state
    ///
    /// A command that exits non-zero is still committed; its failure text
    /// is returned as the result. Only failures to run at all are errors.
    pub async fn run(
        &self,
        id: &str,
        explanation: &str,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let env = self.get(id)?;
        let base = env.container().await?;
        let args = self.exec_args(request);
        let opts = ExecOptions {
            use_entrypoint: request.use_entrypoint,
        };

        let output = cancellable(cancel, self.backend.with_exec(&base, &args, opts)).await?;
        debug!(
            "Command {:?} in {} exited with {}",
            request.command,
            env.id(),
            output.exit_code
        );

        let (text, note) = if output.success() {
            let note = format!("$ {}\n{}\n\n", request.command, output.stdout);
            (output.stdout.clone(), note)
        } else {
            let note = format!(
                "$ {}\nexit {}\nstdout: {}\nstderr: {}\n\n",
                request.command, output.exit_code, output.stdout, output.stderr
            );
            let failure = Error::CommandFailed {
                exit_code: output.exit_code,
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
            };
            (failure.to_string(), note)
        };
        self.audit(&env, &note).await;

        let name = format!("Run {}", request.command);
        self.apply(
            &env,
            Commit::new(name.clone(), explanation).with_output(text.clone()),
            output.state,
            cancel,
        )
        .await?;
        self.propagate_committed(&env, &name, explanation, cancel).await;

        Ok(text)
    }

    /// Start a command as a background service and tunnel its ports to the host
    ///
    /// History is left untouched.
    pub async fn run_background(
        &self,
        id: &str,
        explanation: &str,
        request: &ExecRequest,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<EndpointMappings> {
        let env = self.get(id)?;
        let ports: BTreeSet<u16> = ports.iter().copied().collect();

        let mut state = env.container().await?;
        for port in &ports {
            state = cancellable(cancel, self.backend.with_exposed_port(&state, *port)).await?;
        }

        let args = self.exec_args(request);
        let opts = ExecOptions {
            use_entrypoint: request.use_entrypoint,
        };
        let service = cancellable(cancel, self.backend.start_service(&state, &args, opts)).await?;
        self.audit(&env, &format!("$ {} &\n\n", request.command)).await;

        let mut forwards = Vec::with_capacity(ports.len());
        for port in &ports {
            match self.ports.allocate() {
                Ok(frontend) => forwards.push(PortForward {
                    backend: *port,
                    frontend,
                }),
                Err(e) => {
                    self.release_ports(&forwards);
                    return Err(e);
                }
            }
        }

        let result = async {
            let tunnel = cancellable(cancel, self.tunnel.start(&service, &forwards)).await?;

            let mut endpoints = EndpointMappings::new();
            for forward in &forwards {
                let external = cancellable(
                    cancel,
                    self.tunnel.external_endpoint(&tunnel, forward.frontend),
                )
                .await?;
                let internal = cancellable(
                    cancel,
                    self.tunnel.internal_endpoint(&service, forward.backend),
                )
                .await?;
                endpoints.insert(forward.backend, EndpointMapping { internal, external });
            }
            Ok::<_, Error>(endpoints)
        }
        .await;

        // A started tunnel now holds its host ports; a failed one left them free
        self.release_ports(&forwards);
        let endpoints = result?;
        info!(
            "Environment {} serving {:?} in the background on {} ({})",
            env.id(),
            request.command,
            service.id,
            explanation
        );
        Ok(endpoints)
    }

    fn release_ports(&self, forwards: &[PortForward]) {
        for forward in forwards {
            self.ports.release(forward.frontend);
        }
    }

    /// Set environment variables as one revision
    ///
    /// Every entry is validated before any is applied.
    pub async fn set_env(
        &self,
        id: &str,
        explanation: &str,
        envs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Revision> {
        let variables = parse_assignments(envs)?;
        if variables.is_empty() {
            return Err(Error::InvalidParameter(
                "no environment variables given".to_string(),
            ));
        }

        let env = self.get(id)?;
        let mut state = env.container().await?;
        for (key, value) in &variables {
            state = cancellable(cancel, self.backend.with_env_variable(&state, key, value)).await?;
        }

        self.apply(
            &env,
            Commit::new(format!("Set env {}", envs.join(", ")), explanation),
            state,
            cancel,
        )
        .await
    }
}
