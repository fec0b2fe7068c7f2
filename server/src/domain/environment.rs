//! Environment domain model

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use super::container::ContainerHandle;
use super::revision::{History, Revision, RevisionRecord};
use crate::error::{Error, Result};

/// Directory inside a source tree reserved for environment configuration
pub const CONFIG_DIR: &str = ".environment";

/// Name of the advisory lock marker inside [`CONFIG_DIR`]
pub const LOCK_FILE: &str = "lock";

/// Instructions given to environments that have none yet
pub const DEFAULT_INSTRUCTIONS: &str =
    "No instructions found. Please look around the filesystem and update me";

/// Environment configuration
///
/// Only `workdir`, `base_image`, `setup_commands` and `secrets` are part of
/// the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(skip)]
    pub instructions: String,
    pub workdir: String,
    pub base_image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

impl EnvironmentConfig {
    pub fn new(base_image: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            workdir: workdir.into(),
            base_image: base_image.into(),
            setup_commands: Vec::new(),
            secrets: Vec::new(),
        }
    }
}

/// What remote storage holds for an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEnvironment {
    pub config: EnvironmentConfig,
    pub revisions: Vec<RevisionRecord>,
}

/// State guarded by the environment lock
#[derive(Debug, Default)]
pub struct EnvironmentState {
    pub(crate) container: Option<ContainerHandle>,
    pub(crate) history: History,
    pub(crate) deleted: bool,
}

impl EnvironmentState {
    pub fn container(&self) -> Option<&ContainerHandle> {
        self.container.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Set once the environment has been deleted; no further commits land
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Swap in a committed revision's container and append it
    pub(crate) fn commit(&mut self, container: ContainerHandle, revision: Revision) {
        self.container = Some(container);
        self.history.push(revision);
    }
}

/// One managed sandbox
#[derive(Debug)]
pub struct Environment {
    id: String,
    name: String,
    source: PathBuf,
    config: RwLock<EnvironmentConfig>,
    state: Mutex<EnvironmentState>,
}

impl Environment {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        config: EnvironmentConfig,
    ) -> Self {
        Self::restored(id, name, source, config, History::new())
    }

    /// Create an environment whose history was restored from storage
    pub fn restored(
        id: impl Into<String>,
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        config: EnvironmentConfig,
        history: History,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: source.into(),
            config: RwLock::new(config),
            state: Mutex::new(EnvironmentState {
                container: None,
                history,
                deleted: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Base name of the source tree, used as the storage project name
    pub fn repo_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Path of the advisory lock marker gating configuration updates
    pub fn lock_path(&self) -> PathBuf {
        self.source.join(CONFIG_DIR).join(LOCK_FILE)
    }

    pub async fn config(&self) -> EnvironmentConfig {
        self.config.read().await.clone()
    }

    pub(crate) async fn set_config(&self, config: EnvironmentConfig) {
        *self.config.write().await = config;
    }

    /// Acquire the environment lock
    pub async fn lock(&self) -> MutexGuard<'_, EnvironmentState> {
        self.state.lock().await
    }

    /// Current live container
    pub async fn container(&self) -> Result<ContainerHandle> {
        self.lock()
            .await
            .container
            .clone()
            .ok_or_else(|| Error::Internal(format!("environment {} has no container", self.id)))
    }

    /// Snapshot of the history
    pub async fn history(&self) -> History {
        self.lock().await.history.clone()
    }
}

/// Generate a fresh identifier for an environment called `name`
pub fn generate_id(name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}/{}", name, &suffix[..8])
}

/// Name portion of an environment identifier
pub fn name_from_id(id: &str) -> &str {
    id.split_once('/').map(|(name, _)| name).unwrap_or(id)
}

/// Parse `KEY=VALUE` assignments, rejecting the whole batch on the first bad entry
pub fn parse_assignments(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(Error::InvalidEnvVariable(entry.clone())),
        })
        .collect()
}

/// Parse `KEY=ref` secret declarations
pub fn parse_secrets(entries: &[String]) -> Result<Vec<(String, String)>> {
    parse_assignments(entries).map_err(|e| match e {
        Error::InvalidEnvVariable(entry) => Error::InvalidSecret(entry),
        other => other,
    })
}
