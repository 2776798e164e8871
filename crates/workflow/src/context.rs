//! Per-invocation execution context.

use std::collections::HashMap;
use std::sync::Arc;

use execution_store::{ExecutionId, ExecutionRecord};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::events::{EventSource, WorkflowEvent};
use crate::publisher::EventPublisher;
use crate::step::Compensation;

/// A compensation registered by a completed step, with the step's output.
struct PendingCompensation {
    step: String,
    output: serde_json::Value,
    action: Arc<dyn Compensation>,
}

/// Transient state for one workflow run.
///
/// Created fresh per engine call (or supplied by the caller with metadata
/// pre-populated) and discarded when the call returns. The engine fills in
/// the identifiers, the publisher and the cancellation token before the
/// body runs.
pub struct ExecutionContext {
    execution_id: ExecutionId,
    workflow_name: String,
    correlation_id: Option<String>,
    parent_execution_id: Option<ExecutionId>,
    attempt: i32,
    metadata: HashMap<String, serde_json::Value>,
    executed_steps: Vec<String>,
    total_steps: Option<u32>,
    publisher: Option<Arc<EventPublisher>>,
    cancellation: CancellationToken,
    compensations: Vec<PendingCompensation>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            execution_id: ExecutionId::new(),
            workflow_name: String::new(),
            correlation_id: None,
            parent_execution_id: None,
            attempt: 0,
            metadata: HashMap::new(),
            executed_steps: Vec::new(),
            total_steps: None,
            publisher: None,
            cancellation: CancellationToken::new(),
            compensations: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("workflow_name", &self.workflow_name)
            .field("correlation_id", &self.correlation_id)
            .field("executed_steps", &self.executed_steps)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the correlation id carried on every event.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Pre-populates a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attaches a publisher, for running steps outside the engine.
    pub fn with_publisher(mut self, publisher: Arc<EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn parent_execution_id(&self) -> Option<ExecutionId> {
        self.parent_execution_id
    }

    /// Run number of this execution id. Zero on the first run.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn total_steps(&self) -> Option<u32> {
        self.total_steps
    }

    /// Names of the steps that completed so far, in order.
    pub fn executed_steps(&self) -> &[String] {
        &self.executed_steps
    }

    /// Index the next step will be tagged with.
    pub fn step_index(&self) -> usize {
        self.executed_steps.len()
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Reads a metadata entry as `T`.
    pub fn get_metadata_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StepError> {
        self.metadata
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(StepError::from)
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Serializes `value` into the metadata map.
    pub fn put_metadata<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<(), StepError> {
        self.metadata.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Token fired on timeout or explicit cancel; long-running steps may watch it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn publisher(&self) -> Option<&Arc<EventPublisher>> {
        self.publisher.as_ref()
    }

    /// Broadcasts progress for the step currently running. Never persisted.
    pub async fn report_progress(&self, step: &str, progress: serde_json::Value) {
        let index = self.step_index() as i32;
        self.publish(WorkflowEvent::step_progress(step, index, progress))
            .await;
    }

    /// Number of registered compensations that have not run yet.
    pub fn pending_compensations(&self) -> usize {
        self.compensations.len()
    }

    /// Runs registered compensations in reverse completion order.
    ///
    /// Each compensation runs at most once. Every compensation is attempted
    /// even if an earlier one fails; the first failure is returned.
    pub async fn run_compensations(&mut self) -> Result<(), StepError> {
        let pending = std::mem::take(&mut self.compensations);
        let mut first_error = None;

        for entry in pending.into_iter().rev() {
            tracing::info!(
                execution_id = %self.execution_id,
                step = %entry.step,
                "compensating step"
            );
            if let Err(e) = entry.action.compensate(entry.output, self).await {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    step = %entry.step,
                    error = %e,
                    "compensation step failed"
                );
                first_error.get_or_insert(e.in_step(&entry.step));
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn source(&self) -> EventSource {
        EventSource {
            execution_id: self.execution_id,
            workflow_name: self.workflow_name.clone(),
            correlation_id: self.correlation_id.clone(),
            parent_execution_id: self.parent_execution_id,
            attempt: self.attempt,
        }
    }

    pub(crate) async fn publish(&self, event: WorkflowEvent) {
        if let Some(publisher) = &self.publisher {
            publisher.publish(&self.source(), event).await;
        }
    }

    /// Binds the context to a persisted execution.
    pub(crate) fn bind(
        &mut self,
        record: &ExecutionRecord,
        publisher: Arc<EventPublisher>,
        cancellation: CancellationToken,
        total_steps: Option<u32>,
    ) {
        self.execution_id = record.id;
        self.workflow_name = record.workflow_name.clone();
        self.correlation_id = record.correlation_id.clone();
        self.parent_execution_id = record.parent_execution_id;
        self.attempt = record.attempt;
        self.total_steps = total_steps;
        self.publisher = Some(publisher);
        self.cancellation = cancellation;
    }

    pub(crate) fn record_step(
        &mut self,
        step: &str,
        compensation: Option<(Arc<dyn Compensation>, serde_json::Value)>,
    ) {
        self.executed_steps.push(step.to_string());
        if let Some((action, output)) = compensation {
            self.compensations.push(PendingCompensation {
                step: step.to_string(),
                output,
                action,
            });
        }
    }
}
