//! Registry of live environments

use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::environment::Environment;

/// Identifier to environment map shared by every operation
///
/// Holds exactly one instance per live identifier. Lookups by name scan the
/// map and return whichever match iteration reaches first.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    environments: DashMap<String, Arc<Environment>>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment, replacing any previous entry with the same id
    pub fn insert(&self, env: Arc<Environment>) -> Option<Arc<Environment>> {
        self.environments.insert(env.id().to_string(), env)
    }

    /// Exact identifier match only
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Environment>> {
        self.environments.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Identifier match first, then the first environment carrying that name
    pub fn get(&self, id_or_name: &str) -> Option<Arc<Environment>> {
        self.get_by_id(id_or_name).or_else(|| {
            self.environments
                .iter()
                .find(|entry| entry.value().name() == id_or_name)
                .map(|entry| Arc::clone(entry.value()))
        })
    }

    /// Snapshot of every registered environment
    pub fn list(&self) -> Vec<Arc<Environment>> {
        self.environments
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Environment>> {
        self.environments.remove(id).map(|(_, env)| env)
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}
