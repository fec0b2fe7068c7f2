//! Service layer

pub mod apply;
pub mod environment;
pub mod exec;
pub mod history;
pub mod registry;

pub use environment::{EnvironmentService, EnvironmentUpdate};
pub use exec::ExecRequest;
pub use registry::EnvironmentRegistry;
