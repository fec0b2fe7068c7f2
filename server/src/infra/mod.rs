//! Infrastructure layer

pub mod backend;
pub mod docker;
pub mod git;
pub mod lock;
pub mod memory;
pub mod sqlite;
pub mod storage;
pub mod tracker;
pub mod tunnel;
