use thiserror::Error;

use crate::{ExecutionId, ExecutionStatus, StepStatus, Version};

/// Errors that can occur when interacting with the execution store.
#[derive(Debug, Error)]
pub enum ExecutionStoreError {
    /// The execution was not found in the store.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// The requested status change is not allowed from the current status.
    #[error("Invalid status transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// The execution has used up its retry budget.
    #[error(
        "Retry budget exhausted for execution {execution_id}: {retry_count} of {max_retries} retries used"
    )]
    RetryBudgetExhausted {
        execution_id: ExecutionId,
        retry_count: i32,
        max_retries: i32,
    },

    /// Another execution with the same idempotency key was inserted concurrently.
    #[error("Idempotency conflict for key '{key}' on workflow '{workflow_name}'")]
    IdempotencyConflict { key: String, workflow_name: String },

    /// A step event row for the given position does not exist.
    #[error("Step event not found: execution {execution_id}, step {step_index}")]
    StepEventNotFound {
        execution_id: ExecutionId,
        step_index: i32,
    },

    /// The step already reached a terminal status; the first writer won.
    #[error("Step {step_index} of execution {execution_id} already finalized as {status}")]
    StepAlreadyFinalized {
        execution_id: ExecutionId,
        step_index: i32,
        status: StepStatus,
    },

    /// A concurrent writer updated the step row first.
    #[error(
        "Concurrency conflict for step {step_index} of execution {execution_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        execution_id: ExecutionId,
        step_index: i32,
        expected: Version,
        actual: Version,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionStoreError {
    /// Returns true if this error means a concurrent writer got there first.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            ExecutionStoreError::StepAlreadyFinalized { .. }
                | ExecutionStoreError::ConcurrencyConflict { .. }
                | ExecutionStoreError::IdempotencyConflict { .. }
        )
    }
}

/// Result type for execution store operations.
pub type Result<T> = std::result::Result<T, ExecutionStoreError>;
