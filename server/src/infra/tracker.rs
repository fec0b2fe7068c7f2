//! Tracking and audit capability

use async_trait::async_trait;

use crate::domain::environment::Environment;
use crate::error::Result;

/// Mirrors environment actions into an external version-control reference
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Establish the tracking reference for an environment's source
    async fn setup(&self, env: &Environment) -> Result<()>;

    /// Record an action on the tracking reference
    async fn propagate(&self, env: &Environment, message: &str, explanation: &str) -> Result<()>;

    /// Remove the tracking reference
    async fn delete(&self, env: &Environment) -> Result<()>;

    /// Append an audit note to the tracking reference
    async fn append_note(&self, env: &Environment, text: &str) -> Result<()>;

    /// Uncommitted changes in the source tree, empty when clean
    async fn uncommitted_diff(&self, env: &Environment) -> Result<String>;
}
