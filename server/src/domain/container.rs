//! Container state references
//!
//! A [`ContainerHandle`] is a live, backend-owned container state that can be
//! passed straight back to the backend. A [`ContainerId`] is the durable
//! identifier the backend hands out for a state; it survives restarts and can
//! be turned back into a handle with `ContainerBackend::load`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Live handle to a container state owned by a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable identifier of a container state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container state held by a revision: either live or only resolvable by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRef {
    Live(ContainerHandle),
    Reference(ContainerId),
}

impl ContainerRef {
    /// The live handle, if this state has not been evicted to a reference
    pub fn live(&self) -> Option<&ContainerHandle> {
        match self {
            ContainerRef::Live(handle) => Some(handle),
            ContainerRef::Reference(_) => None,
        }
    }
}

/// Handle to a container started as a long-lived service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Backend identifier of the running service
    pub id: String,
    /// Address the service is reachable at on the service network
    pub host: String,
}

/// Handle to a started host tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    /// Backend identifiers of the forwarding processes
    pub ids: Vec<String>,
    /// Host-side address the forwarded ports are bound on
    pub host: String,
    /// Forwarded (service port, host port) pairs
    pub forwards: Vec<PortForward>,
}

/// One host port forwarded to a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    /// Port inside the service
    pub backend: u16,
    /// Port on the host
    pub frontend: u16,
}

/// Options for executing inside a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Prepend the image entrypoint to the arguments
    pub use_entrypoint: bool,
}

/// Result of an exec that the backend managed to run
///
/// A non-zero `exit_code` is a command-level failure; `state` still carries
/// whatever the command changed before exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub state: ContainerHandle,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
