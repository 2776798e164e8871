use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ExecutionId, ExecutionRecord, ExecutionStatistics, ExecutionStoreError, NewExecution,
    NewStepEvent, Page, PageRequest, Result, StepEventRecord, StepStart, StepTermination,
};

/// Outcome of claiming an idempotency key for a workflow.
#[derive(Debug, Clone)]
pub enum IdempotencyClaim {
    /// No execution existed; a new running row was inserted.
    Started(ExecutionRecord),
    /// A failed or cleaned-up execution was reset to running with its retry count bumped.
    Resumed(ExecutionRecord),
    /// A previous execution already completed; its cached result should be returned.
    Completed(ExecutionRecord),
    /// Another execution with this key is still running or paused.
    InProgress(ExecutionRecord),
    /// The execution for this key was cancelled and is never reopened.
    Cancelled(ExecutionRecord),
}

impl IdempotencyClaim {
    pub fn record(&self) -> &ExecutionRecord {
        match self {
            IdempotencyClaim::Started(r)
            | IdempotencyClaim::Resumed(r)
            | IdempotencyClaim::Completed(r)
            | IdempotencyClaim::InProgress(r)
            | IdempotencyClaim::Cancelled(r) => r,
        }
    }

    /// Returns true if the caller now owns the execution and should run it.
    pub fn should_execute(&self) -> bool {
        matches!(
            self,
            IdempotencyClaim::Started(_) | IdempotencyClaim::Resumed(_)
        )
    }
}

/// Durable record of execution state transitions.
///
/// Implementations are shared by many writers and must enforce the
/// status state machine on every mutation.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts a new running execution.
    ///
    /// Fails with `IdempotencyConflict` if the request carries an idempotency
    /// key already used for the same workflow.
    async fn create_execution(&self, execution: NewExecution) -> Result<ExecutionRecord>;

    /// Marks a running execution completed and stores its serialized result.
    async fn complete_execution(
        &self,
        id: ExecutionId,
        result: serde_json::Value,
    ) -> Result<ExecutionRecord>;

    /// Marks a running execution failed.
    async fn fail_execution(&self, id: ExecutionId, error: &str) -> Result<ExecutionRecord>;

    /// Marks a failed execution compensated.
    async fn compensate_execution(&self, id: ExecutionId) -> Result<ExecutionRecord>;

    /// Consumes one unit of retry budget on a failed execution.
    ///
    /// The status is left unchanged; the retry itself runs as a new execution.
    async fn retry_execution(&self, id: ExecutionId) -> Result<ExecutionRecord>;

    /// Moves a running execution to paused.
    async fn pause_execution(&self, id: ExecutionId) -> Result<ExecutionRecord>;

    /// Moves a paused execution back to running.
    async fn resume_execution(&self, id: ExecutionId) -> Result<ExecutionRecord>;

    /// Marks a non-terminal execution cancelled.
    async fn cancel_execution(&self, id: ExecutionId) -> Result<ExecutionRecord>;

    /// Loads an execution by ID.
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>>;

    /// Lists executions of a workflow, newest first.
    async fn find_executions_by_workflow(
        &self,
        workflow_name: &str,
        page: PageRequest,
    ) -> Result<Page<ExecutionRecord>>;

    /// Aggregates execution counts for a workflow created at or after `since`.
    async fn get_statistics(
        &self,
        workflow_name: &str,
        since: DateTime<Utc>,
    ) -> Result<ExecutionStatistics>;

    /// Looks up an execution by idempotency key without locking it.
    async fn find_by_idempotency_key(
        &self,
        key: &str,
        workflow_name: &str,
    ) -> Result<Option<ExecutionRecord>>;

    /// Atomically looks up `(key, workflow_name)` under a row lock and decides
    /// whether the caller may run it.
    ///
    /// A lost insert race surfaces as `IdempotencyConflict`.
    async fn claim_idempotency_key(&self, execution: NewExecution) -> Result<IdempotencyClaim>;
}

/// Extension trait providing convenience methods for execution stores.
#[async_trait]
pub trait ExecutionStoreExt: ExecutionStore {
    /// Loads an execution, failing with `ExecutionNotFound` if it is missing.
    async fn require_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.get_execution(id)
            .await?
            .ok_or(ExecutionStoreError::ExecutionNotFound(id))
    }
}

impl<T: ExecutionStore + ?Sized> ExecutionStoreExt for T {}

/// Persistence for per-step lifecycle rows.
///
/// Rows are keyed by `(execution_id, attempt, step_index)`.
#[async_trait]
pub trait StepEventStore: Send + Sync {
    /// Inserts a running row for `(execution_id, attempt, step_index)`.
    ///
    /// A duplicate insert is not an error: the existing row is returned.
    async fn record_step_started(&self, event: NewStepEvent) -> Result<StepStart>;

    /// Moves a step row to a terminal status.
    ///
    /// The first terminal write wins. A later writer receives
    /// `StepAlreadyFinalized`, and a writer whose version check fails
    /// receives `ConcurrencyConflict`; neither overwrites the stored row.
    async fn record_step_finished(&self, termination: StepTermination)
    -> Result<StepEventRecord>;

    /// Loads a single step row.
    async fn get_step_event(
        &self,
        execution_id: ExecutionId,
        attempt: i32,
        step_index: i32,
    ) -> Result<Option<StepEventRecord>>;

    /// Loads the step rows of the latest attempt ordered by step index.
    async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>>;

    /// Loads the step rows of every attempt ordered by attempt, then step index.
    async fn get_step_history(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>>;
}
