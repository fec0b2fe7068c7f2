//! Revert and fork

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::apply::{cancellable, Commit};
use super::environment::{validate_name, EnvironmentService};
use crate::domain::environment::{generate_id, Environment};
use crate::domain::revision::{Revision, Version};
use crate::error::{Error, Result};
use crate::infra::backend::resolve;

impl EnvironmentService {
    /// Commit an earlier revision's state as the new latest revision
    pub async fn revert(
        &self,
        id: &str,
        explanation: &str,
        version: u64,
        cancel: &CancellationToken,
    ) -> Result<Revision> {
        let env = self.get(id)?;
        let target = env
            .history()
            .await
            .get(Version(version))
            .cloned()
            .ok_or(Error::VersionNotFound(version))?;

        let container = cancellable(cancel, resolve(self.backend.as_ref(), &target.container)).await?;

        let name = format!("Revert to {}", target.name);
        let revision = self
            .apply(&env, Commit::new(name.clone(), explanation), container, cancel)
            .await?;
        self.propagate_committed(&env, &name, explanation, cancel).await;
        Ok(revision)
    }

    /// Start a new environment from a revision, the latest when `version` is `None`
    pub async fn fork(
        &self,
        id: &str,
        explanation: &str,
        name: &str,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Environment>> {
        validate_name(name)?;

        let parent = self.get(id)?;
        let history = parent.history().await;
        let source = match version {
            Some(v) => history.get(Version(v)),
            None => history.latest(),
        }
        .cloned()
        .ok_or(Error::VersionNotFound(version.unwrap_or(0)))?;

        let container = cancellable(cancel, resolve(self.backend.as_ref(), &source.container)).await?;

        let fork = Arc::new(Environment::new(
            generate_id(name),
            name,
            parent.source(),
            parent.config().await,
        ));
        self.attach(&fork, cancel).await?;

        self.apply(
            &fork,
            Commit::new(format!("Fork from {}", parent.name()), explanation),
            container,
            cancel,
        )
        .await?;

        info!(
            "Environment {} forked from {} at version {}",
            fork.id(),
            parent.id(),
            source.version
        );
        self.registry.insert(Arc::clone(&fork));
        Ok(fork)
    }
}
