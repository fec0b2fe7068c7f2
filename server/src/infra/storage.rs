//! Remote storage capability

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::environment::{Environment, PersistedEnvironment};
use crate::domain::revision::Revision;
use crate::error::Result;

/// Durable persistence of environment metadata and audit data
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Ensure storage exists for `project` and return its URL
    ///
    /// Must succeed before any other call for that project.
    async fn remote_url(&self, project: &str) -> Result<String>;

    /// Initialize a durable record for the environment
    async fn create(&self, env: &Environment) -> Result<()>;

    /// Record a committed revision together with the current configuration
    async fn save(&self, env: &Environment, revision: &Revision) -> Result<()>;

    /// Append an audit note
    async fn note(&self, env: &Environment, text: &str) -> Result<()>;

    /// Record a patch of source changes
    async fn patch(&self, env: &Environment, diff: &str) -> Result<()>;

    /// Load the persisted record; `Error::RecordNotFound` when there is none
    async fn load(&self, env: &Environment) -> Result<PersistedEnvironment>;

    /// Remove all durable state for an environment
    async fn delete(&self, repo_name: &str, env_id: &str) -> Result<()>;

    /// Directory whose contents seed the base container
    async fn base_project_dir(&self, env: &Environment) -> Result<PathBuf>;
}
