//! Environment Server
//!
//! Versioned, containerized sandboxes for source repositories, served over
//! HTTP and MCP.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};

use service::EnvironmentService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub environment_service: Arc<EnvironmentService>,
}

impl AppState {
    pub fn new(config: Arc<Config>, environment_service: Arc<EnvironmentService>) -> Self {
        Self {
            config,
            environment_service,
        }
    }
}
