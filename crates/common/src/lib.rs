//! Shared types used across the workflow engine crates.

mod types;

pub use types::ExecutionId;
