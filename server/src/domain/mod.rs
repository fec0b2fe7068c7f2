//! Domain models

pub mod container;
pub mod endpoint;
pub mod environment;
pub mod revision;
