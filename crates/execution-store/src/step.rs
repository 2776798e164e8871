use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ExecutionId;

/// Row version used for optimistic concurrency on step events.
///
/// A freshly inserted step row is at version 1; every accepted update
/// increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of a freshly inserted row.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(StepStatus::Running),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// Persisted lifecycle row for one step of one execution.
///
/// `(execution_id, attempt, step_index)` is unique. Each run of an
/// execution id (first run, idempotent reset, resume) is its own attempt,
/// so a re-run never collides with the rows of an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEventRecord {
    pub execution_id: ExecutionId,
    pub attempt: i32,
    pub workflow_name: String,
    pub step_name: String,
    pub step_index: i32,
    pub total_steps: Option<i32>,
    pub status: StepStatus,
    pub input_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: Version,
}

/// A step-started row to insert.
#[derive(Debug, Clone)]
pub struct NewStepEvent {
    pub execution_id: ExecutionId,
    pub attempt: i32,
    pub workflow_name: String,
    pub step_name: String,
    pub step_index: i32,
    pub total_steps: Option<i32>,
    pub input_data: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
}

impl NewStepEvent {
    pub(crate) fn into_record(self) -> StepEventRecord {
        StepEventRecord {
            execution_id: self.execution_id,
            attempt: self.attempt,
            workflow_name: self.workflow_name,
            step_name: self.step_name,
            step_index: self.step_index,
            total_steps: self.total_steps,
            status: StepStatus::Running,
            input_data: self.input_data,
            output_data: None,
            error_message: None,
            error_type: None,
            duration_ms: None,
            started_at: self.started_at,
            completed_at: None,
            version: Version::first(),
        }
    }
}

/// Outcome of inserting a step-started row.
#[derive(Debug, Clone)]
pub enum StepStart {
    /// The row was inserted.
    Inserted(StepEventRecord),
    /// A row for this position already existed and was reused.
    Existing(StepEventRecord),
}

impl StepStart {
    pub fn record(&self) -> &StepEventRecord {
        match self {
            StepStart::Inserted(record) | StepStart::Existing(record) => record,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, StepStart::Inserted(_))
    }
}

/// A terminal update for a step row.
#[derive(Debug, Clone)]
pub struct StepTermination {
    pub execution_id: ExecutionId,
    pub attempt: i32,
    pub workflow_name: String,
    pub step_name: String,
    pub step_index: i32,
    pub total_steps: Option<i32>,
    pub status: StepStatus,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: i64,
    pub completed_at: DateTime<Utc>,
}

impl StepTermination {
    pub(crate) fn apply_to(&self, record: &mut StepEventRecord) {
        record.status = self.status;
        record.output_data = self.output_data.clone();
        record.error_message = self.error_message.clone();
        record.error_type = self.error_type.clone();
        record.duration_ms = Some(self.duration_ms);
        record.completed_at = Some(self.completed_at);
        record.version = record.version.next();
    }

    /// Builds the row for a step whose started event was never persisted.
    pub(crate) fn into_record(self) -> StepEventRecord {
        let started_at = self.completed_at - chrono::Duration::milliseconds(self.duration_ms);
        StepEventRecord {
            execution_id: self.execution_id,
            attempt: self.attempt,
            workflow_name: self.workflow_name,
            step_name: self.step_name,
            step_index: self.step_index,
            total_steps: self.total_steps,
            status: self.status,
            input_data: None,
            output_data: self.output_data,
            error_message: self.error_message,
            error_type: self.error_type,
            duration_ms: Some(self.duration_ms),
            started_at,
            completed_at: Some(self.completed_at),
            version: Version::first(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::first();
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn step_status_terminality() {
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }

    #[test]
    fn step_status_parses_database_names() {
        assert_eq!("COMPLETED".parse::<StepStatus>(), Ok(StepStatus::Completed));
        assert!("DONE".parse::<StepStatus>().is_err());
    }

    #[test]
    fn termination_bumps_version() {
        let mut record = NewStepEvent {
            execution_id: ExecutionId::new(),
            attempt: 0,
            workflow_name: "wf".to_string(),
            step_name: "reserve".to_string(),
            step_index: 0,
            total_steps: Some(2),
            input_data: None,
            started_at: Utc::now(),
        }
        .into_record();

        let termination = StepTermination {
            execution_id: record.execution_id,
            attempt: 0,
            workflow_name: "wf".to_string(),
            step_name: "reserve".to_string(),
            step_index: 0,
            total_steps: Some(2),
            status: StepStatus::Completed,
            output_data: Some(serde_json::json!({"ok": true})),
            error_message: None,
            error_type: None,
            duration_ms: 12,
            completed_at: Utc::now(),
        };
        termination.apply_to(&mut record);

        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.version, Version::new(2));
        assert_eq!(record.duration_ms, Some(12));
    }
}
