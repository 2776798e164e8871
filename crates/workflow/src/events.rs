//! Workflow and step lifecycle events.

use chrono::{DateTime, Utc};
use execution_store::ExecutionId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted while a workflow runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    /// Workflow execution started.
    WorkflowStarted(WorkflowStartedData),

    /// Workflow body returned success.
    WorkflowCompleted(WorkflowCompletedData),

    /// Workflow failed (business failure, exception, timeout or lock).
    WorkflowFailed(WorkflowFailedData),

    /// Compensation finished after a failure.
    WorkflowCompensated(WorkflowCompensatedData),

    /// A step started.
    StepStarted(StepStartedData),

    /// A step completed successfully.
    StepCompleted(StepCompletedData),

    /// A step raised an error.
    StepFailed(StepFailedData),

    /// Fine-grained progress inside a step. Broadcast only.
    StepProgress(StepProgressData),
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted(_) => "WorkflowStarted",
            WorkflowEvent::WorkflowCompleted(_) => "WorkflowCompleted",
            WorkflowEvent::WorkflowFailed(_) => "WorkflowFailed",
            WorkflowEvent::WorkflowCompensated(_) => "WorkflowCompensated",
            WorkflowEvent::StepStarted(_) => "StepStarted",
            WorkflowEvent::StepCompleted(_) => "StepCompleted",
            WorkflowEvent::StepFailed(_) => "StepFailed",
            WorkflowEvent::StepProgress(_) => "StepProgress",
        }
    }

    /// The execution or step status this event reports.
    pub fn status(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted(_)
            | WorkflowEvent::StepStarted(_)
            | WorkflowEvent::StepProgress(_) => "RUNNING",
            WorkflowEvent::WorkflowCompleted(_) | WorkflowEvent::StepCompleted(_) => "COMPLETED",
            WorkflowEvent::WorkflowFailed(_) | WorkflowEvent::StepFailed(_) => "FAILED",
            WorkflowEvent::WorkflowCompensated(_) => "COMPENSATED",
        }
    }

    /// Progress events skip the durable sink and the step store.
    pub fn is_broadcast_only(&self) -> bool {
        matches!(self, WorkflowEvent::StepProgress(_))
    }

    pub fn workflow_started(input: serde_json::Value) -> Self {
        WorkflowEvent::WorkflowStarted(WorkflowStartedData { input })
    }

    pub fn workflow_completed(output: serde_json::Value, duration_ms: i64) -> Self {
        WorkflowEvent::WorkflowCompleted(WorkflowCompletedData {
            output,
            duration_ms,
        })
    }

    pub fn workflow_failed(
        error_type: impl Into<String>,
        error: impl Into<String>,
        duration_ms: i64,
    ) -> Self {
        WorkflowEvent::WorkflowFailed(WorkflowFailedData {
            error: error.into(),
            error_type: error_type.into(),
            duration_ms,
        })
    }

    pub fn workflow_compensated(duration_ms: i64) -> Self {
        WorkflowEvent::WorkflowCompensated(WorkflowCompensatedData { duration_ms })
    }

    pub fn step_started(
        step_name: impl Into<String>,
        step_index: i32,
        total_steps: Option<i32>,
        input: Option<serde_json::Value>,
    ) -> Self {
        WorkflowEvent::StepStarted(StepStartedData {
            step_name: step_name.into(),
            step_index,
            total_steps,
            input,
        })
    }

    pub fn step_completed(
        step_name: impl Into<String>,
        step_index: i32,
        total_steps: Option<i32>,
        output: Option<serde_json::Value>,
        duration_ms: i64,
    ) -> Self {
        WorkflowEvent::StepCompleted(StepCompletedData {
            step_name: step_name.into(),
            step_index,
            total_steps,
            output,
            duration_ms,
        })
    }

    pub fn step_failed(
        step_name: impl Into<String>,
        step_index: i32,
        total_steps: Option<i32>,
        error_type: impl Into<String>,
        error: impl Into<String>,
        duration_ms: i64,
    ) -> Self {
        WorkflowEvent::StepFailed(StepFailedData {
            step_name: step_name.into(),
            step_index,
            total_steps,
            error: error.into(),
            error_type: error_type.into(),
            duration_ms,
        })
    }

    pub fn step_progress(
        step_name: impl Into<String>,
        step_index: i32,
        progress: serde_json::Value,
    ) -> Self {
        WorkflowEvent::StepProgress(StepProgressData {
            step_name: step_name.into(),
            step_index,
            progress,
        })
    }
}

/// Data for WorkflowStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedData {
    pub input: serde_json::Value,
}

/// Data for WorkflowCompleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletedData {
    pub output: serde_json::Value,
    pub duration_ms: i64,
}

/// Data for WorkflowFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailedData {
    pub error: String,
    pub error_type: String,
    pub duration_ms: i64,
}

/// Data for WorkflowCompensated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompensatedData {
    pub duration_ms: i64,
}

/// Data for StepStarted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step_name: String,
    pub step_index: i32,
    pub total_steps: Option<i32>,
    pub input: Option<serde_json::Value>,
}

/// Data for StepCompleted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_name: String,
    pub step_index: i32,
    pub total_steps: Option<i32>,
    pub output: Option<serde_json::Value>,
    pub duration_ms: i64,
}

/// Data for StepFailed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_name: String,
    pub step_index: i32,
    pub total_steps: Option<i32>,
    pub error: String,
    pub error_type: String,
    pub duration_ms: i64,
}

/// Data for StepProgress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgressData {
    pub step_name: String,
    pub step_index: i32,
    pub progress: serde_json::Value,
}

/// Identifies the execution an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub execution_id: ExecutionId,
    pub workflow_name: String,
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
    /// Run number of the execution; step rows are keyed by it.
    pub attempt: i32,
}

/// Flat wire shape written to both sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub execution_id: ExecutionId,
    pub workflow_name: String,
    pub step_name: Option<String>,
    pub step_index: Option<i32>,
    pub total_steps: Option<i32>,
    pub status: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub parent_execution_id: Option<ExecutionId>,
}

impl EventEnvelope {
    /// Flattens `event` for `source`.
    pub fn new(source: &EventSource, event: &WorkflowEvent) -> Self {
        let mut envelope = Self {
            event_id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            execution_id: source.execution_id,
            workflow_name: source.workflow_name.clone(),
            step_name: None,
            step_index: None,
            total_steps: None,
            status: event.status().to_string(),
            input: None,
            output: None,
            error: None,
            error_type: None,
            duration_ms: None,
            timestamp: Utc::now(),
            correlation_id: source.correlation_id.clone(),
            parent_execution_id: source.parent_execution_id,
        };

        match event {
            WorkflowEvent::WorkflowStarted(data) => {
                envelope.input = Some(data.input.clone());
            }
            WorkflowEvent::WorkflowCompleted(data) => {
                envelope.output = Some(data.output.clone());
                envelope.duration_ms = Some(data.duration_ms);
            }
            WorkflowEvent::WorkflowFailed(data) => {
                envelope.error = Some(data.error.clone());
                envelope.error_type = Some(data.error_type.clone());
                envelope.duration_ms = Some(data.duration_ms);
            }
            WorkflowEvent::WorkflowCompensated(data) => {
                envelope.duration_ms = Some(data.duration_ms);
            }
            WorkflowEvent::StepStarted(data) => {
                envelope.step_name = Some(data.step_name.clone());
                envelope.step_index = Some(data.step_index);
                envelope.total_steps = data.total_steps;
                envelope.input = data.input.clone();
            }
            WorkflowEvent::StepCompleted(data) => {
                envelope.step_name = Some(data.step_name.clone());
                envelope.step_index = Some(data.step_index);
                envelope.total_steps = data.total_steps;
                envelope.output = data.output.clone();
                envelope.duration_ms = Some(data.duration_ms);
            }
            WorkflowEvent::StepFailed(data) => {
                envelope.step_name = Some(data.step_name.clone());
                envelope.step_index = Some(data.step_index);
                envelope.total_steps = data.total_steps;
                envelope.error = Some(data.error.clone());
                envelope.error_type = Some(data.error_type.clone());
                envelope.duration_ms = Some(data.duration_ms);
            }
            WorkflowEvent::StepProgress(data) => {
                envelope.step_name = Some(data.step_name.clone());
                envelope.step_index = Some(data.step_index);
                envelope.output = Some(data.progress.clone());
            }
        }

        envelope
    }

    /// Partition key for the durable sink; keeps one execution's events ordered.
    pub fn partition_key(&self) -> String {
        self.execution_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> EventSource {
        EventSource {
            execution_id: ExecutionId::new(),
            workflow_name: "order-processing".to_string(),
            correlation_id: Some("corr".to_string()),
            parent_execution_id: None,
            attempt: 0,
        }
    }

    #[test]
    fn test_tagged_serialization() {
        let event = WorkflowEvent::step_started("reserve", 0, Some(2), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StepStarted");
        assert_eq!(json["data"]["step_name"], "reserve");

        let back: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_envelope_flattens_step_failure() {
        let source = source();
        let event = WorkflowEvent::step_failed("charge", 1, Some(2), "Declined", "card", 15);
        let envelope = EventEnvelope::new(&source, &event);

        assert_eq!(envelope.event_type, "StepFailed");
        assert_eq!(envelope.status, "FAILED");
        assert_eq!(envelope.step_index, Some(1));
        assert_eq!(envelope.error_type.as_deref(), Some("Declined"));
        assert_eq!(envelope.duration_ms, Some(15));
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr"));
        assert_eq!(envelope.partition_key(), source.execution_id.to_string());
    }

    #[test]
    fn test_envelope_uses_camel_case() {
        let envelope = EventEnvelope::new(&source(), &WorkflowEvent::workflow_compensated(3));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["eventType"], "WorkflowCompensated");
        assert_eq!(json["status"], "COMPENSATED");
        assert!(json.get("executionId").is_some());
    }

    #[test]
    fn test_only_progress_is_broadcast_only() {
        assert!(WorkflowEvent::step_progress("s", 0, serde_json::json!(50)).is_broadcast_only());
        assert!(!WorkflowEvent::workflow_started(serde_json::json!({})).is_broadcast_only());
    }
}
