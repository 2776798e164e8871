use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{ExecutionId, ExecutionStoreError, Result};

/// Lifecycle status of a workflow execution.
///
/// State transitions:
/// ```text
/// Running ──┬──► Completed
///           ├──► Failed ──┬──► Compensated
///           │             └──► Running (idempotent reset)
///           ├──► Paused ──┬──► Running (resume)
///           │             └──► Completed | Failed (run finished elsewhere)
///           └──► Cancelled (from any non-terminal state)
///
/// Compensated | CleanedUp ──► Running (idempotent reset only)
/// ```
///
/// An idempotent re-submission may reopen a COMPENSATED execution, since
/// that is where a failed run normally ends. CANCELLED is never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// The workflow body is executing.
    #[default]
    Running,

    /// The workflow finished successfully (terminal state).
    Completed,

    /// The workflow failed; compensation may or may not have run yet.
    Failed,

    /// The workflow failed and its compensation succeeded (terminal state).
    Compensated,

    /// The execution was paused by an operator.
    Paused,

    /// The execution was cancelled (terminal state).
    Cancelled,

    /// Partial effects of a failed execution were cleaned up out of band.
    CleanedUp,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Compensated | ExecutionStatus::Cancelled
        )
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Running, Completed | Failed | Paused | Cancelled) => true,
            (Failed, Compensated | Running | Cancelled) => true,
            (Paused, Running | Completed | Failed | Cancelled) => true,
            (CleanedUp, Running) => true,
            _ => false,
        }
    }

    /// Returns true if an idempotent re-submission may reset this execution to running.
    pub fn is_resettable(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed | ExecutionStatus::Compensated | ExecutionStatus::CleanedUp
        )
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Compensated => "COMPENSATED",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::CleanedUp => "CLEANED_UP",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "COMPENSATED" => Ok(ExecutionStatus::Compensated),
            "PAUSED" => Ok(ExecutionStatus::Paused),
            "CANCELLED" => Ok(ExecutionStatus::Cancelled),
            "CLEANED_UP" => Ok(ExecutionStatus::CleanedUp),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Durable record of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// The serialized workflow input.
    pub input: serde_json::Value,
    /// The serialized workflow output, set on completion.
    pub result: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
    pub idempotency_key: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Run number under this id; bumped by idempotent resets and resumes.
    pub attempt: i32,
    pub timeout_seconds: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// Deserializes the stored input into the workflow's input type.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.input.clone())?)
    }

    /// Deserializes the stored result, if any.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.result
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Returns true if the execution may be retried.
    pub fn can_retry(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::Compensated
        ) && self.retry_count < self.max_retries
    }

    /// Returns the wall-clock duration of a finished execution.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }

    pub(crate) fn transition(&mut self, next: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ExecutionStoreError::InvalidTransition {
                execution_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() || next == ExecutionStatus::Failed {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value) -> Result<()> {
        self.transition(ExecutionStatus::Completed)?;
        self.result = Some(result);
        self.error_message = None;
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, error: &str) -> Result<()> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(error.to_string());
        Ok(())
    }

    pub(crate) fn consume_retry(&mut self) -> Result<()> {
        if !matches!(
            self.status,
            ExecutionStatus::Failed | ExecutionStatus::Compensated
        ) {
            return Err(ExecutionStoreError::InvalidTransition {
                execution_id: self.id,
                from: self.status,
                to: ExecutionStatus::Running,
            });
        }
        if self.retry_count >= self.max_retries {
            return Err(ExecutionStoreError::RetryBudgetExhausted {
                execution_id: self.id,
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub(crate) fn resume(&mut self) -> Result<()> {
        if self.status != ExecutionStatus::Paused {
            return Err(ExecutionStoreError::InvalidTransition {
                execution_id: self.id,
                from: self.status,
                to: ExecutionStatus::Running,
            });
        }
        self.transition(ExecutionStatus::Running)?;
        self.attempt += 1;
        Ok(())
    }

    /// Reopens a failed, compensated or cleaned-up execution for an
    /// idempotent re-submission as a new attempt.
    pub(crate) fn reset_for_resubmission(&mut self) -> Result<()> {
        if !self.status.is_resettable() {
            return Err(ExecutionStoreError::InvalidTransition {
                execution_id: self.id,
                from: self.status,
                to: ExecutionStatus::Running,
            });
        }
        self.status = ExecutionStatus::Running;
        self.retry_count += 1;
        self.attempt += 1;
        self.error_message = None;
        self.completed_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Parameters for creating a new execution record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: ExecutionId,
    pub workflow_name: String,
    pub input: serde_json::Value,
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
    pub idempotency_key: Option<String>,
    pub max_retries: i32,
    pub timeout_seconds: i64,
}

impl NewExecution {
    /// Creates a new execution request with a generated ID.
    pub fn new(workflow_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_name: workflow_name.into(),
            input,
            correlation_id: None,
            parent_execution_id: None,
            idempotency_key: None,
            max_retries: 0,
            timeout_seconds: 0,
        }
    }

    pub fn correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn parent_execution_id(mut self, parent: Option<ExecutionId>) -> Self {
        self.parent_execution_id = parent;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Materializes the request into a running record.
    pub fn into_record(self) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: self.id,
            workflow_name: self.workflow_name,
            status: ExecutionStatus::Running,
            input: self.input,
            result: None,
            correlation_id: self.correlation_id,
            parent_execution_id: self.parent_execution_id,
            idempotency_key: self.idempotency_key,
            retry_count: 0,
            max_retries: self.max_retries,
            attempt: 0,
            timeout_seconds: self.timeout_seconds,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Aggregated execution counts for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub workflow_name: String,
    pub since: Option<DateTime<Utc>>,
    pub total: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub compensated: u64,
    pub paused: u64,
    pub cancelled: u64,
    /// Mean duration of finished executions, in milliseconds.
    pub average_duration_ms: Option<f64>,
}

impl ExecutionStatistics {
    /// Fraction of finished executions that completed successfully.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed + self.failed + self.compensated;
        (finished > 0).then(|| self.completed as f64 / finished as f64)
    }

    pub(crate) fn count(&mut self, status: ExecutionStatus, n: u64) {
        self.total += n;
        let bucket = match status {
            ExecutionStatus::Running => &mut self.running,
            ExecutionStatus::Completed => &mut self.completed,
            ExecutionStatus::Failed | ExecutionStatus::CleanedUp => &mut self.failed,
            ExecutionStatus::Compensated => &mut self.compensated,
            ExecutionStatus::Paused => &mut self.paused,
            ExecutionStatus::Cancelled => &mut self.cancelled,
        };
        *bucket += n;
    }
}
