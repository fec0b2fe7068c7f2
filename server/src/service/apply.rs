//! The commit protocol
//!
//! [`EnvironmentService::apply`] is the only way an environment's history
//! grows or its container changes.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::environment::EnvironmentService;
use crate::domain::container::{ContainerHandle, ContainerRef};
use crate::domain::environment::Environment;
use crate::domain::revision::Revision;
use crate::error::{Error, Result};

/// Run `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Metadata of a revision about to be committed
#[derive(Debug, Clone)]
pub(crate) struct Commit {
    pub name: String,
    pub explanation: String,
    pub output: String,
}

impl Commit {
    pub fn new(name: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            explanation: explanation.into(),
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

impl EnvironmentService {
    /// Commit `candidate` as the next revision of `env`
    ///
    /// Realizing the candidate happens outside the environment lock and can
    /// be cancelled. The locked section (version allocation, persistence,
    /// swap and append) runs on its own task and always completes once
    /// started, even if the caller goes away.
    pub(crate) async fn apply(
        &self,
        env: &Arc<Environment>,
        commit: Commit,
        candidate: ContainerHandle,
        cancel: &CancellationToken,
    ) -> Result<Revision> {
        cancellable(cancel, self.backend.sync(&candidate)).await?;
        let state = cancellable(cancel, self.backend.id(&candidate)).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let env = Arc::clone(env);
        let storage = Arc::clone(&self.storage);

        let task = tokio::spawn(async move {
            let mut guard = env.lock().await;
            if guard.is_deleted() {
                return Err(Error::EnvironmentNotFound(env.id().to_string()));
            }
            let revision = Revision {
                version: guard.history().latest_version().next(),
                name: commit.name,
                explanation: commit.explanation,
                output: commit.output,
                created_at: Utc::now(),
                state,
                container: ContainerRef::Live(candidate.clone()),
            };

            storage.save(&env, &revision).await?;
            guard.commit(candidate, revision.clone());
            info!(
                "Environment {} committed version {}: {}",
                env.id(),
                revision.version,
                revision.name
            );
            Ok::<_, Error>(revision)
        });

        let revision = task
            .await
            .map_err(|e| Error::Internal(format!("commit task failed: {}", e)))??;
        debug!("Revision {} holds state {}", revision.version, revision.state);
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancellable_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
