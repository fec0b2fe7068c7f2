//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use environment_server::infra::memory::{MemoryBackend, MemoryStorage, MemoryTracker, MemoryTunnel};
use environment_server::infra::tracker::Tracker;
use environment_server::service::{EnvironmentRegistry, EnvironmentService};
use environment_server::Config;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A service wired to in-memory collaborators, plus handles to inspect them
pub struct Harness {
    pub service: Arc<EnvironmentService>,
    pub backend: Arc<MemoryBackend>,
    pub tunnel: Arc<MemoryTunnel>,
    pub storage: Arc<MemoryStorage>,
    pub tracker: Arc<MemoryTracker>,
    pub config: Arc<Config>,
    pub source: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(base_config(), None)
    }

    /// Use `tracker` in place of the in-memory tracker
    pub fn with_tracker(tracker: Arc<dyn Tracker>) -> Self {
        Self::build(base_config(), Some(tracker))
    }

    /// Hand out tunnel host ports from `[start, end)`
    pub fn with_port_range(start: u16, end: u16) -> Self {
        let config = Config {
            tunnel_port_start: start,
            tunnel_port_end: end,
            ..base_config()
        };
        Self::build(config, None)
    }

    fn build(config: Config, tracker: Option<Arc<dyn Tracker>>) -> Self {
        let config = Arc::new(config);

        let source = tempfile::Builder::new()
            .prefix("project-")
            .tempdir()
            .unwrap();
        std::fs::write(source.path().join("README.md"), "hello\n").unwrap();

        let backend = Arc::new(MemoryBackend::new());
        let tunnel = Arc::new(MemoryTunnel::new());
        let storage = Arc::new(MemoryStorage::new());
        let memory_tracker = Arc::new(MemoryTracker::new());
        let tracker: Arc<dyn Tracker> = tracker.unwrap_or_else(|| memory_tracker.clone());

        let service = Arc::new(EnvironmentService::new(
            Arc::new(EnvironmentRegistry::new()),
            backend.clone(),
            tunnel.clone(),
            storage.clone(),
            tracker,
            config.clone(),
        ));

        Self {
            service,
            backend,
            tunnel,
            storage,
            tracker: memory_tracker,
            config,
            source,
        }
    }

    /// Name of the storage project for the source tree
    pub fn repo_name(&self) -> String {
        self.source
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn base_config() -> Config {
    Config {
        backend: "memory".to_string(),
        tracker: "memory".to_string(),
        base_image: "alpine:3.20".to_string(),
        ..Config::default()
    }
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
