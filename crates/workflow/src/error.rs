//! Workflow error types.

use std::time::Duration;

use execution_store::{ExecutionId, ExecutionStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type used by step bodies to signal cancellation.
pub const CANCELLED_ERROR_TYPE: &str = "Cancelled";

/// An unexpected error raised by a step or workflow body.
///
/// Business failures are returned as [`crate::Outcome::Failure`] values
/// instead; a `StepError` always means something went wrong that the
/// workflow did not anticipate.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct StepError {
    /// The step that raised the error, when known.
    pub step: Option<String>,
    /// A short classifier, e.g. the error's type name.
    pub error_type: String,
    /// Human-readable description.
    pub message: String,
}

impl StepError {
    /// Creates a new step error.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: None,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Creates a step error from any error value, classified by its type name.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let short = type_name.rsplit("::").next().unwrap_or(type_name);
        Self::new(short, error.to_string())
    }

    /// The error returned when a step refuses to start on a cancelled execution.
    pub fn cancelled(step: &str) -> Self {
        Self::new(CANCELLED_ERROR_TYPE, "execution was cancelled").in_step(step)
    }

    /// Tags the error with the step that raised it, unless already tagged.
    pub fn in_step(mut self, step: &str) -> Self {
        self.step.get_or_insert_with(|| step.to_string());
        self
    }

    /// Returns true if this error came from a cancelled execution.
    pub fn is_cancelled(&self) -> bool {
        self.error_type == CANCELLED_ERROR_TYPE
    }
}

impl From<serde_json::Error> for StepError {
    fn from(error: serde_json::Error) -> Self {
        Self::from_error(&error)
    }
}

/// Errors that sinks return when an event cannot be delivered.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The sink is no longer accepting events.
    #[error("Sink closed: {0}")]
    Closed(String),

    /// The durable store rejected the event.
    #[error("Store error: {0}")]
    Store(#[from] ExecutionStoreError),

    /// The envelope could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to engine callers.
///
/// Business failures are not errors; they come back as
/// [`crate::Outcome::Failure`].
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No workflow is registered under the name.
    #[error("Workflow not registered: {0}")]
    NotFound(String),

    /// The call-site types do not match the registered workflow.
    #[error(
        "Type mismatch for workflow '{workflow}': registered {expected}, called with {actual}"
    )]
    TypeMismatch {
        workflow: String,
        expected: String,
        actual: String,
    },

    /// Another holder owns the lock key.
    #[error("Lock not acquired: {key}")]
    LockNotAcquired { key: String },

    /// The workflow body did not finish in time.
    #[error("Workflow '{workflow}' execution {execution_id} timed out after {timeout:?}")]
    Timeout {
        workflow: String,
        execution_id: ExecutionId,
        timeout: Duration,
    },

    /// The execution is not in a state that permits the operation.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The execution does not exist.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// An execution for the idempotency key is still running.
    #[error("Execution {execution_id} for idempotency key '{key}' is in progress")]
    InProgress {
        key: String,
        execution_id: ExecutionId,
    },

    /// A concurrent submission with the same idempotency key won the insert.
    #[error("Idempotency conflict for key '{key}' on workflow '{workflow}'")]
    IdempotencyConflict { key: String, workflow: String },

    /// Execution store error.
    #[error("Execution store error: {0}")]
    Store(#[source] ExecutionStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ExecutionStoreError> for WorkflowError {
    fn from(error: ExecutionStoreError) -> Self {
        match error {
            ExecutionStoreError::ExecutionNotFound(id) => WorkflowError::ExecutionNotFound(id),
            ExecutionStoreError::InvalidTransition { .. }
            | ExecutionStoreError::RetryBudgetExhausted { .. } => {
                WorkflowError::IllegalState(error.to_string())
            }
            ExecutionStoreError::IdempotencyConflict { key, workflow_name } => {
                WorkflowError::IdempotencyConflict {
                    key,
                    workflow: workflow_name,
                }
            }
            other => WorkflowError::Store(other),
        }
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
