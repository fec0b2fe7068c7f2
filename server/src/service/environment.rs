//! Environment service
//!
//! Lifecycle operations over the registry and the collaborators. Mutating
//! command operations live in `exec`, history operations in `history`.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::apply::{cancellable, Commit};
use super::registry::EnvironmentRegistry;
use crate::domain::container::{ContainerHandle, ExecOptions};
use crate::domain::environment::{
    generate_id, name_from_id, parse_secrets, Environment, EnvironmentConfig,
    PersistedEnvironment,
};
use crate::domain::revision::{History, Revision};
use crate::error::{Error, Result};
use crate::infra::backend::ContainerBackend;
use crate::infra::lock::LockMarker;
use crate::infra::storage::RemoteStorage;
use crate::infra::tracker::Tracker;
use crate::infra::tunnel::{HostTunnel, PortAllocator};
use crate::Config;

/// Replacement configuration for [`EnvironmentService::update`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentUpdate {
    #[serde(default)]
    pub instructions: String,
    pub base_image: String,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
}

/// Environment service for managing environment lifecycle
pub struct EnvironmentService {
    pub(crate) registry: Arc<EnvironmentRegistry>,
    pub(crate) backend: Arc<dyn ContainerBackend>,
    pub(crate) tunnel: Arc<dyn HostTunnel>,
    pub(crate) storage: Arc<dyn RemoteStorage>,
    pub(crate) tracker: Arc<dyn Tracker>,
    pub(crate) ports: PortAllocator,
    pub(crate) config: Arc<Config>,
    opening: DashMap<String, Arc<Mutex<()>>>,
}

impl EnvironmentService {
    /// Create a new environment service
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        backend: Arc<dyn ContainerBackend>,
        tunnel: Arc<dyn HostTunnel>,
        storage: Arc<dyn RemoteStorage>,
        tracker: Arc<dyn Tracker>,
        config: Arc<Config>,
    ) -> Self {
        let ports = PortAllocator::new(config.tunnel_port_start, config.tunnel_port_end);
        Self {
            registry,
            backend,
            tunnel,
            storage,
            tracker,
            ports,
            config,
            opening: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    /// Create a fresh environment for `source`
    pub async fn create(
        &self,
        explanation: &str,
        source: &Path,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Environment>> {
        validate_name(name)?;

        let config = EnvironmentConfig::new(&self.config.base_image, &self.config.workdir);
        let env = Arc::new(Environment::new(generate_id(name), name, source, config));
        info!("Creating environment {} from {}", env.id(), source.display());

        if let Err(e) = self.initialize(&env, explanation, cancel).await {
            self.discard(&env).await;
            return Err(e);
        }

        self.registry.insert(Arc::clone(&env));
        Ok(env)
    }

    /// Attach, build and commit the first revision of a new environment
    async fn initialize(
        &self,
        env: &Arc<Environment>,
        explanation: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.attach(env, cancel).await?;
        match cancellable(cancel, self.storage.load(env)).await {
            Ok(persisted) => self.restore(env, persisted).await?,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.record_patch(env, cancel).await?;

        let config = env.config().await;
        let container = self.build_base(env, &config, cancel).await?;
        info!(
            "Environment {} built from {} (workdir {})",
            env.id(),
            config.base_image,
            config.workdir
        );

        self.apply(
            env,
            Commit::new("Create environment", "Create the environment"),
            container,
            cancel,
        )
        .await?;
        self.propagate(env, &format!("Init env {}", env.name()), explanation, cancel)
            .await
    }

    /// Best-effort removal of tracking and records for an environment that never took
    async fn discard(&self, env: &Environment) {
        if let Err(e) = self.tracker.delete(env).await {
            warn!("Failed to remove tracking for {}: {}", env.id(), e);
        }
        if let Err(e) = self.storage.delete(&env.repo_name(), env.id()).await {
            warn!("Failed to remove stored record for {}: {}", env.id(), e);
        }
    }

    /// Open a persisted environment, or create one when nothing is persisted
    pub async fn open(
        &self,
        explanation: &str,
        source: &Path,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Environment>> {
        if let Some(env) = self.registry.get_by_id(id) {
            return Ok(env);
        }

        // One open per id at a time; later ones find the first one's instance
        let gate = Arc::clone(self.opening.entry(id.to_string()).or_default().value());
        let result = {
            let _opening = gate.lock().await;
            match self.registry.get_by_id(id) {
                Some(env) => Ok(env),
                None => self.open_persisted(explanation, source, id, cancel).await,
            }
        };
        self.opening.remove_if(id, |_, g| Arc::strong_count(g) <= 2);
        result
    }

    async fn open_persisted(
        &self,
        explanation: &str,
        source: &Path,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Environment>> {
        let name = name_from_id(id);
        validate_name(name)?;
        let config = EnvironmentConfig::new(&self.config.base_image, &self.config.workdir);
        let env = Arc::new(Environment::new(id, name, source, config));

        self.attach(&env, cancel).await?;
        let persisted = match cancellable(cancel, self.storage.load(&env)).await {
            Ok(persisted) => persisted,
            Err(e) if e.is_not_found() => {
                info!("No persisted record for {}, creating", id);
                self.discard(&env).await;
                return self.create(explanation, source, name, cancel).await;
            }
            Err(e) => return Err(e),
        };
        self.restore(&env, persisted).await?;

        let config = env.config().await;
        let container = self.build_base(&env, &config, cancel).await?;
        self.apply(
            &env,
            Commit::new("Open environment", "Open the environment"),
            container,
            cancel,
        )
        .await?;

        info!(
            "Opened environment {} with {} revisions",
            env.id(),
            env.history().await.len()
        );
        self.registry.insert(Arc::clone(&env));
        Ok(env)
    }

    /// Look up a live environment by identifier, then by name
    pub fn get(&self, id_or_name: &str) -> Result<Arc<Environment>> {
        self.registry
            .get(id_or_name)
            .ok_or_else(|| Error::EnvironmentNotFound(id_or_name.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<Environment>> {
        self.registry.list()
    }

    /// Replace the configuration and rebuild the base container
    pub async fn update(
        &self,
        id: &str,
        explanation: &str,
        update: EnvironmentUpdate,
        cancel: &CancellationToken,
    ) -> Result<Revision> {
        let env = self.get(id)?;
        LockMarker::new(env.lock_path()).ensure_unlocked().await?;

        if update.base_image.trim().is_empty() {
            return Err(Error::InvalidParameter("base_image must not be empty".to_string()));
        }

        let previous = env.config().await;
        let candidate = EnvironmentConfig {
            instructions: update.instructions,
            workdir: previous.workdir.clone(),
            base_image: update.base_image,
            setup_commands: update.setup_commands,
            secrets: update.secrets,
        };

        let container = self.build_base(&env, &candidate, cancel).await?;

        // Storage records the configuration current at commit time
        env.set_config(candidate).await;
        let revision = match self
            .apply(
                &env,
                Commit::new("Update environment", explanation),
                container,
                cancel,
            )
            .await
        {
            Ok(revision) => revision,
            Err(e) => {
                env.set_config(previous).await;
                return Err(e);
            }
        };

        self.propagate_committed(
            &env,
            &format!("Update environment {}", env.name()),
            explanation,
            cancel,
        )
        .await;
        Ok(revision)
    }

    /// Tear down tracking and storage, then forget the environment
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let env = self.get(id)?;
        let mut guard = env.lock().await;

        cancellable(cancel, self.tracker.delete(&env)).await?;
        cancellable(cancel, self.storage.delete(&env.repo_name(), env.id())).await?;

        // Commits already waiting on the lock must not bring the record back
        guard.deleted = true;
        self.registry.remove(env.id());
        info!("Environment {} deleted", env.id());
        Ok(())
    }

    /// Every revision, oldest first
    pub async fn history(&self, id: &str) -> Result<Vec<Revision>> {
        let env = self.get(id)?;
        let history = env.history().await;
        Ok(history.iter().cloned().collect())
    }

    /// Publish the current container state to an image registry
    pub async fn checkpoint(
        &self,
        id: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if target.trim().is_empty() {
            return Err(Error::InvalidParameter("target must not be empty".to_string()));
        }
        let env = self.get(id)?;
        let container = env.container().await?;
        let published = cancellable(cancel, self.backend.publish(&container, target)).await?;
        info!("Environment {} checkpointed to {}", env.id(), published);
        Ok(published)
    }

    /// Attach an interactive terminal to the current container state
    pub async fn terminal(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let env = self.get(id)?;
        let container = env.container().await?;
        cancellable(cancel, self.backend.terminal(&container)).await
    }

    /// Take the advisory lock marker; false if it was already held
    pub async fn lock(&self, id: &str) -> Result<bool> {
        let env = self.get(id)?;
        LockMarker::new(env.lock_path()).acquire().await
    }

    /// Drop the advisory lock marker; false if it was not held
    pub async fn unlock(&self, id: &str) -> Result<bool> {
        let env = self.get(id)?;
        LockMarker::new(env.lock_path()).release().await
    }

    pub async fn is_locked(&self, id: &str) -> Result<bool> {
        let env = self.get(id)?;
        Ok(LockMarker::new(env.lock_path()).is_held().await)
    }

    /// Build the base container for `config`
    ///
    /// Secrets are validated before anything is built. Each setup command's
    /// transcript goes to the audit trail; the first failing one aborts.
    pub(crate) async fn build_base(
        &self,
        env: &Environment,
        config: &EnvironmentConfig,
        cancel: &CancellationToken,
    ) -> Result<ContainerHandle> {
        let secrets = parse_secrets(&config.secrets)?;
        let source_dir = cancellable(cancel, self.storage.base_project_dir(env)).await?;

        let mut container = cancellable(cancel, self.backend.from_image(&config.base_image)).await?;
        container =
            cancellable(cancel, self.backend.with_workdir(&container, &config.workdir)).await?;

        self.audit(
            env,
            &format!(
                "Environment {} created with base image {}\n\n",
                env.id(),
                config.base_image
            ),
        )
        .await;

        for (name, secret_ref) in &secrets {
            container = cancellable(
                cancel,
                self.backend
                    .with_secret_variable(&container, name, secret_ref),
            )
            .await?;
        }

        for command in &config.setup_commands {
            let args = vec![
                self.config.shell.clone(),
                "-c".to_string(),
                command.clone(),
            ];
            let output = cancellable(
                cancel,
                self.backend
                    .with_exec(&container, &args, ExecOptions::default()),
            )
            .await?;

            if !output.success() {
                self.audit(
                    env,
                    &format!(
                        "$ {}\nexit {}\nstdout: {}\nstderr: {}\n\n",
                        command, output.exit_code, output.stdout, output.stderr
                    ),
                )
                .await;
                return Err(Error::SetupCommandFailed {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }

            self.audit(env, &format!("$ {}\n{}\n\n", command, output.stdout))
                .await;
            container = output.state;
        }

        cancellable(
            cancel,
            self.backend.with_directory(&container, ".", &source_dir),
        )
        .await
    }

    /// Append an audit note; failures are logged and ignored
    pub(crate) async fn audit(&self, env: &Environment, text: &str) {
        if let Err(e) = self.tracker.append_note(env, text).await {
            warn!("Failed to add tracking note for {}: {}", env.id(), e);
        }
        if let Err(e) = self.storage.note(env, text).await {
            warn!("Failed to store note for {}: {}", env.id(), e);
        }
    }

    /// Record an action on the tracking reference
    pub(crate) async fn propagate(
        &self,
        env: &Environment,
        message: &str,
        explanation: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancellable(cancel, self.tracker.propagate(env, message, explanation)).await
    }

    /// Record an already committed action; a failure leaves the revision in place
    pub(crate) async fn propagate_committed(
        &self,
        env: &Environment,
        message: &str,
        explanation: &str,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = self.propagate(env, message, explanation, cancel).await {
            warn!(
                "Committed {:?} in {} but failed to track it: {}",
                message,
                env.id(),
                e
            );
        }
    }

    /// Ensure remote storage and tracking exist for a new environment
    pub(crate) async fn attach(&self, env: &Environment, cancel: &CancellationToken) -> Result<()> {
        let project = env.repo_name();
        let url = cancellable(cancel, self.storage.remote_url(&project)).await?;
        cancellable(cancel, self.tracker.setup(env)).await?;
        cancellable(cancel, self.storage.create(env)).await?;
        info!("Environment {} attached to {}", env.id(), url);
        Ok(())
    }

    /// Adopt persisted configuration and history
    async fn restore(&self, env: &Environment, persisted: PersistedEnvironment) -> Result<()> {
        let history = History::restore(persisted.revisions).map_err(Error::Storage)?;

        let mut config = persisted.config;
        if config.instructions.is_empty() {
            config.instructions = env.config().await.instructions;
        }
        env.set_config(config).await;

        let mut state = env.lock().await;
        state.history = history;
        Ok(())
    }

    /// Store uncommitted source changes as a patch
    async fn record_patch(&self, env: &Environment, cancel: &CancellationToken) -> Result<()> {
        let diff = cancellable(cancel, self.tracker.uncommitted_diff(env)).await?;
        if !diff.is_empty() {
            cancellable(cancel, self.storage.patch(env, &diff)).await?;
        }
        Ok(())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidParameter(format!(
            "invalid environment name {:?}",
            name
        )));
    }
    Ok(())
}
