//! The workflow engine.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use execution_store::{
    ExecutionId, ExecutionRecord, ExecutionStatistics, ExecutionStatus, ExecutionStore,
    ExecutionStoreExt, IdempotencyClaim, LockStore, NewExecution, Page, PageRequest,
    StepEventRecord, StepEventStore,
};
use futures_util::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, ResolvedOptions, WorkflowOptions};
use crate::context::ExecutionContext;
use crate::error::{Result, WorkflowError};
use crate::events::WorkflowEvent;
use crate::outcome::{Failure, FailureKind, Outcome};
use crate::publisher::EventPublisher;
use crate::registry::{ErasedWorkflow, RegisteredWorkflow, WorkflowInfo, stored_timeout};
use crate::workflow::Workflow;

/// Executes workflows with persistence, locking, timeouts and compensation.
///
/// Every run goes through the same sequence: create a RUNNING record,
/// publish `WorkflowStarted`, take the lock, run the body under a timeout,
/// then record the terminal status and compensate on failure. The lock is
/// released on every path that acquired it.
pub struct WorkflowEngine {
    config: EngineConfig,
    executions: Arc<dyn ExecutionStore>,
    steps: Arc<dyn StepEventStore>,
    locks: Arc<dyn LockStore>,
    publisher: Arc<EventPublisher>,
    registry: RwLock<HashMap<String, RegisteredWorkflow>>,
    active: Mutex<HashMap<ExecutionId, CancellationToken>>,
}

impl WorkflowEngine {
    /// Creates an engine over the given stores.
    pub fn new(
        config: EngineConfig,
        executions: Arc<dyn ExecutionStore>,
        steps: Arc<dyn StepEventStore>,
        locks: Arc<dyn LockStore>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config,
            executions,
            steps,
            locks,
            publisher,
            registry: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    /// Registers a workflow under its name, replacing any previous registration.
    pub async fn register_workflow<W: Workflow + 'static>(&self, workflow: W) {
        let entry = RegisteredWorkflow::new(workflow);
        let name = entry.info().name.clone();
        let mut registry = self.registry.write().await;
        if registry.insert(name.clone(), entry).is_some() {
            tracing::warn!(workflow = %name, "workflow re-registered, previous registration replaced");
        } else {
            tracing::info!(workflow = %name, "workflow registered");
        }
    }

    /// Registered workflows, sorted by name.
    pub async fn list_workflows(&self) -> Vec<WorkflowInfo> {
        let registry = self.registry.read().await;
        let mut infos: Vec<WorkflowInfo> = registry.values().map(|e| e.info().clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Executes a registered workflow by name.
    ///
    /// Fails with `NotFound` for unknown names and `TypeMismatch` when `I`/`O`
    /// differ from the registered workflow's types.
    pub async fn execute<I, O>(
        &self,
        name: &str,
        input: I,
        ctx: Option<ExecutionContext>,
        options: WorkflowOptions,
    ) -> Result<Outcome<O>>
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
    {
        let workflow = {
            let registry = self.registry.read().await;
            registry
                .get(name)
                .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?
                .typed::<I, O>()?
        };
        self.execute_workflow(workflow.as_ref(), input, ctx, options)
            .await
    }

    /// Executes a registered workflow with JSON input and output.
    pub async fn execute_json(
        &self,
        name: &str,
        input: serde_json::Value,
        options: WorkflowOptions,
    ) -> Result<Outcome<serde_json::Value>> {
        let runner = self.runner(name).await?;
        runner.execute_json(self, input, options).await
    }

    /// Executes a workflow directly, without registration.
    #[tracing::instrument(skip_all, fields(workflow = %workflow.name()))]
    pub async fn execute_workflow<W: Workflow + ?Sized>(
        &self,
        workflow: &W,
        input: W::Input,
        ctx: Option<ExecutionContext>,
        options: WorkflowOptions,
    ) -> Result<Outcome<W::Output>> {
        let options = options.resolve(&self.config);
        let ctx = ctx.unwrap_or_default();

        let mut execution = self
            .new_execution(workflow.name(), &input, &options)?
            .correlation_id(
                options
                    .correlation_id
                    .clone()
                    .or_else(|| ctx.correlation_id().map(str::to_string)),
            )
            .parent_execution_id(options.parent_execution_id.or(ctx.parent_execution_id()));
        execution.id = ctx.execution_id();

        let record = self.executions.create_execution(execution).await?;
        self.run_with_record(workflow, input, record, ctx, &options)
            .await
    }

    /// Executes a workflow at most once per idempotency key.
    ///
    /// A completed key returns the stored result without running the body.
    /// A key whose execution is still running fails with `InProgress`, and a
    /// cancelled key with `IllegalState`. A key whose previous execution
    /// failed is reopened and run again as a new attempt.
    #[tracing::instrument(skip(self, workflow, input, options), fields(workflow = %workflow.name()))]
    pub async fn execute_idempotent<W: Workflow + ?Sized>(
        &self,
        key: &str,
        workflow: &W,
        input: W::Input,
        options: WorkflowOptions,
    ) -> Result<Outcome<W::Output>> {
        let options = options.resolve(&self.config);
        let execution = self
            .new_execution(workflow.name(), &input, &options)?
            .correlation_id(options.correlation_id.clone())
            .parent_execution_id(options.parent_execution_id)
            .idempotency_key(key);

        match self.executions.claim_idempotency_key(execution).await? {
            IdempotencyClaim::Completed(record) => {
                metrics::counter!(
                    "workflow_idempotent_hits_total",
                    "workflow" => workflow.name().to_string()
                )
                .increment(1);
                tracing::info!(execution_id = %record.id, "returning stored result for idempotency key");
                let output = serde_json::from_value(record.result.unwrap_or_default())?;
                Ok(Outcome::Success(output))
            }
            IdempotencyClaim::InProgress(record) => Err(WorkflowError::InProgress {
                key: key.to_string(),
                execution_id: record.id,
            }),
            IdempotencyClaim::Cancelled(record) => Err(WorkflowError::IllegalState(format!(
                "execution {} for idempotency key '{key}' was cancelled",
                record.id
            ))),
            IdempotencyClaim::Started(record) | IdempotencyClaim::Resumed(record) => {
                self.run_with_record(workflow, input, record, ExecutionContext::new(), &options)
                    .await
            }
        }
    }

    /// Re-runs a failed execution from its stored input as a child execution.
    ///
    /// Allowed from FAILED or COMPENSATED while the retry budget lasts.
    /// Consumes one retry on the original record.
    #[tracing::instrument(skip(self))]
    pub async fn retry_execution(&self, id: ExecutionId) -> Result<Outcome<serde_json::Value>> {
        let record = self.executions.require_execution(id).await?;
        if !record.can_retry() {
            return Err(WorkflowError::IllegalState(format!(
                "execution {id} cannot be retried from {} with {} of {} retries used",
                record.status, record.retry_count, record.max_retries
            )));
        }

        let runner = self.runner(&record.workflow_name).await?;
        let updated = self.executions.retry_execution(id).await?;

        metrics::counter!(
            "workflow_retries_total",
            "workflow" => record.workflow_name.clone()
        )
        .increment(1);
        tracing::info!(retry_count = updated.retry_count, "retrying execution");

        let options = WorkflowOptions {
            parent_execution_id: Some(id),
            correlation_id: record.correlation_id.clone(),
            max_retries: Some(updated.max_retries - updated.retry_count),
            timeout: Some(stored_timeout(&record, self)),
            lock_key: None,
            lock_ttl: None,
        };
        runner.execute_json(self, record.input, options).await
    }

    /// Marks a running execution as paused.
    ///
    /// Refused while the body is in flight in this process; such a run still
    /// records its own terminal status. A run owned by another process that
    /// finishes after the pause is recorded as COMPLETED or FAILED.
    #[tracing::instrument(skip(self))]
    pub async fn pause_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        if self.is_running(id).await {
            return Err(WorkflowError::IllegalState(format!(
                "execution {id} is in flight in this process and cannot be paused"
            )));
        }
        let record = self.executions.pause_execution(id).await?;
        tracing::info!("execution paused");
        Ok(record)
    }

    /// Resumes a paused execution by re-running its stored input under the same id.
    #[tracing::instrument(skip(self))]
    pub async fn resume_execution(&self, id: ExecutionId) -> Result<Outcome<serde_json::Value>> {
        let record = self.executions.require_execution(id).await?;
        if record.status != ExecutionStatus::Paused {
            return Err(WorkflowError::IllegalState(format!(
                "execution {id} is {}, only PAUSED executions can be resumed",
                record.status
            )));
        }
        if self.is_running(id).await {
            return Err(WorkflowError::IllegalState(format!(
                "execution {id} is still running in this process"
            )));
        }

        let runner = self.runner(&record.workflow_name).await?;
        let record = self.executions.resume_execution(id).await?;
        tracing::info!("execution resumed");
        runner.resume_json(self, record).await
    }

    /// Cancels an execution and fires the cancellation token of its in-flight run.
    ///
    /// Cancellation is cooperative: the running step finishes and the next
    /// one refuses to start.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        let record = self.executions.cancel_execution(id).await?;
        if let Some(token) = self.active.lock().await.get(&id) {
            token.cancel();
        }
        metrics::counter!(
            "workflow_cancellations_total",
            "workflow" => record.workflow_name.clone()
        )
        .increment(1);
        tracing::info!("execution cancelled");
        Ok(record)
    }

    pub async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self.executions.get_execution(id).await?)
    }

    pub async fn find_executions_by_workflow(
        &self,
        workflow_name: &str,
        page: PageRequest,
    ) -> Result<Page<ExecutionRecord>> {
        Ok(self
            .executions
            .find_executions_by_workflow(workflow_name, page)
            .await?)
    }

    pub async fn get_statistics(
        &self,
        workflow_name: &str,
        since: DateTime<Utc>,
    ) -> Result<ExecutionStatistics> {
        Ok(self.executions.get_statistics(workflow_name, since).await?)
    }

    /// Step rows of the latest attempt of an execution, ordered by step index.
    pub async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>> {
        Ok(self.steps.get_step_events(execution_id).await?)
    }

    /// Step rows of every attempt, ordered by attempt then step index.
    pub async fn get_step_history(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<StepEventRecord>> {
        Ok(self.steps.get_step_history(execution_id).await?)
    }

    /// Returns true if the execution's body is running in this process.
    pub async fn is_running(&self, id: ExecutionId) -> bool {
        self.active.lock().await.contains_key(&id)
    }

    /// Pings the lock store.
    pub async fn is_healthy(&self) -> bool {
        match self.locks.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "lock store health check failed");
                false
            }
        }
    }

    async fn runner(&self, name: &str) -> Result<Arc<dyn ErasedWorkflow>> {
        let registry = self.registry.read().await;
        registry
            .get(name)
            .map(RegisteredWorkflow::runner)
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))
    }

    fn new_execution<I: Serialize>(
        &self,
        name: &str,
        input: &I,
        options: &ResolvedOptions,
    ) -> Result<NewExecution> {
        Ok(NewExecution::new(name, serde_json::to_value(input)?)
            .max_retries(options.max_retries)
            .timeout_seconds(options.timeout.as_secs_f64().ceil() as i64))
    }

    /// Runs a workflow against an existing RUNNING record.
    pub(crate) async fn run_with_record<W: Workflow + ?Sized>(
        &self,
        workflow: &W,
        input: W::Input,
        record: ExecutionRecord,
        mut ctx: ExecutionContext,
        options: &ResolvedOptions,
    ) -> Result<Outcome<W::Output>> {
        let execution_id = record.id;
        let name = workflow.name().to_string();
        let token = ctx.cancellation_token().clone();
        ctx.bind(
            &record,
            self.publisher.clone(),
            token.clone(),
            workflow.total_steps(),
        );
        self.active.lock().await.insert(execution_id, token);

        let result = self
            .run_locked(workflow, input, &record, &mut ctx, options)
            .await;

        self.active.lock().await.remove(&execution_id);
        tracing::debug!(workflow = %name, %execution_id, "execution finished");
        result
    }

    async fn run_locked<W: Workflow + ?Sized>(
        &self,
        workflow: &W,
        input: W::Input,
        record: &ExecutionRecord,
        ctx: &mut ExecutionContext,
        options: &ResolvedOptions,
    ) -> Result<Outcome<W::Output>> {
        let execution_id = record.id;
        let name = workflow.name().to_string();
        let started = Instant::now();

        metrics::counter!("workflow_executions_total", "workflow" => name.clone()).increment(1);
        ctx.publish(WorkflowEvent::workflow_started(record.input.clone()))
            .await;
        tracing::info!(workflow = %name, %execution_id, "workflow started");

        let lock_key = options
            .lock_key
            .clone()
            .unwrap_or_else(|| format!("workflow:lock:{name}:{execution_id}"));
        let acquired = self
            .locks
            .set_if_absent_with_expiry(&lock_key, &execution_id.to_string(), options.lock_ttl)
            .await;

        match acquired {
            Ok(true) => {}
            Ok(false) => {
                metrics::counter!("workflow_lock_not_acquired_total", "workflow" => name.clone())
                    .increment(1);
                tracing::warn!(workflow = %name, %execution_id, lock_key = %lock_key, "lock not acquired");
                let message = format!("lock not acquired: {lock_key}");
                self.abort(ctx, "LockNotAcquired", &message, started).await;
                return Err(WorkflowError::LockNotAcquired { key: lock_key });
            }
            Err(e) => {
                tracing::error!(workflow = %name, %execution_id, error = %e, "lock store unavailable");
                self.abort(ctx, "LockStoreError", &e.to_string(), started)
                    .await;
                return Err(e.into());
            }
        }

        let result = self.run_body(workflow, input, ctx, options, started).await;

        if let Err(e) = self.locks.delete(&lock_key).await {
            tracing::warn!(%execution_id, lock_key = %lock_key, error = %e, "failed to release lock");
        }
        result
    }

    async fn run_body<W: Workflow + ?Sized>(
        &self,
        workflow: &W,
        input: W::Input,
        ctx: &mut ExecutionContext,
        options: &ResolvedOptions,
        started: Instant,
    ) -> Result<Outcome<W::Output>> {
        let execution_id = ctx.execution_id();
        let name = workflow.name().to_string();

        let body = AssertUnwindSafe(workflow.execute(input, ctx)).catch_unwind();
        let result = tokio::time::timeout(options.timeout, body).await;
        let failure = match result {
            Ok(Ok(Ok(Outcome::Success(output)))) => match serde_json::to_value(&output) {
                Ok(json) => {
                    self.complete(ctx, json, started).await;
                    return Ok(Outcome::Success(output));
                }
                Err(e) => Failure::exception("Serialization", e.to_string()),
            },
            Ok(Ok(Ok(Outcome::Failure(failure)))) => {
                tracing::warn!(
                    workflow = %name,
                    %execution_id,
                    error_type = %failure.error_type,
                    error = %failure.message,
                    "workflow returned failure"
                );
                failure
            }
            Ok(Ok(Err(error))) => {
                tracing::error!(
                    workflow = %name,
                    %execution_id,
                    step = ?error.step,
                    error = %error,
                    "workflow raised an error"
                );
                Failure::from(error)
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(workflow = %name, %execution_id, panic = %message, "workflow panicked");
                Failure::exception("Panic", message)
            }
            Err(_) => {
                ctx.cancellation_token().cancel();
                tracing::error!(workflow = %name, %execution_id, timeout = ?options.timeout, "workflow timed out");
                Failure::timeout(options.timeout)
            }
        };

        let timed_out = failure.kind == FailureKind::Timeout;
        self.fail_and_compensate(workflow, ctx, &failure, started)
            .await;

        if timed_out {
            return Err(WorkflowError::Timeout {
                workflow: name,
                execution_id,
                timeout: options.timeout,
            });
        }
        Ok(Outcome::Failure(failure))
    }

    async fn complete(&self, ctx: &ExecutionContext, result: serde_json::Value, started: Instant) {
        let execution_id = ctx.execution_id();
        if let Err(e) = self
            .executions
            .complete_execution(execution_id, result.clone())
            .await
        {
            tracing::warn!(%execution_id, error = %e, "could not record completion");
        }

        let elapsed = started.elapsed();
        ctx.publish(WorkflowEvent::workflow_completed(
            result,
            elapsed.as_millis() as i64,
        ))
        .await;

        let workflow = ctx.workflow_name().to_string();
        metrics::counter!("workflow_completed_total", "workflow" => workflow.clone()).increment(1);
        metrics::histogram!("workflow_duration_seconds", "workflow" => workflow)
            .record(elapsed.as_secs_f64());
        tracing::info!(
            workflow = %ctx.workflow_name(),
            %execution_id,
            duration_ms = elapsed.as_millis() as u64,
            "workflow completed"
        );
    }

    async fn fail_and_compensate<W: Workflow + ?Sized>(
        &self,
        workflow: &W,
        ctx: &mut ExecutionContext,
        failure: &Failure,
        started: Instant,
    ) {
        let execution_id = ctx.execution_id();
        let name = workflow.name().to_string();
        // A cancelled record is already terminal
        let cancelled = failure.kind == FailureKind::Cancelled;

        if !cancelled
            && let Err(e) = self
                .executions
                .fail_execution(execution_id, &failure.to_string())
                .await
        {
            tracing::warn!(%execution_id, error = %e, "could not record failure");
        }
        ctx.publish(WorkflowEvent::workflow_failed(
            &failure.error_type,
            &failure.message,
            started.elapsed().as_millis() as i64,
        ))
        .await;

        let counter = if failure.kind == FailureKind::Timeout {
            "workflow_timeouts_total"
        } else {
            "workflow_failed_total"
        };
        metrics::counter!(counter, "workflow" => name.clone(), "kind" => failure.kind.as_str())
            .increment(1);

        let compensation = AssertUnwindSafe(workflow.compensate(ctx))
            .catch_unwind()
            .await;
        match compensation {
            Ok(Ok(())) => {
                if !cancelled
                    && let Err(e) = self.executions.compensate_execution(execution_id).await
                {
                    tracing::warn!(%execution_id, error = %e, "could not record compensation");
                }
                ctx.publish(WorkflowEvent::workflow_compensated(
                    started.elapsed().as_millis() as i64,
                ))
                .await;
                metrics::counter!("workflow_compensations_total", "workflow" => name.clone())
                    .increment(1);
                tracing::info!(workflow = %name, %execution_id, "workflow compensated");
            }
            Ok(Err(e)) => {
                metrics::counter!("workflow_compensation_failures_total", "workflow" => name.clone())
                    .increment(1);
                tracing::warn!(workflow = %name, %execution_id, error = %e, "compensation failed");
            }
            Err(panic) => {
                metrics::counter!("workflow_compensation_failures_total", "workflow" => name.clone())
                    .increment(1);
                tracing::warn!(
                    workflow = %name,
                    %execution_id,
                    panic = %panic_message(panic.as_ref()),
                    "compensation panicked"
                );
            }
        }
    }

    /// Fails a run that never reached its body.
    async fn abort(&self, ctx: &ExecutionContext, error_type: &str, message: &str, started: Instant) {
        let execution_id = ctx.execution_id();
        if let Err(e) = self.executions.fail_execution(execution_id, message).await {
            tracing::warn!(%execution_id, error = %e, "could not record failure");
        }
        ctx.publish(WorkflowEvent::workflow_failed(
            error_type,
            message,
            started.elapsed().as_millis() as i64,
        ))
        .await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let static_payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let owned_payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        let other_payload: Box<dyn std::any::Any + Send> = Box::new(42u32);

        assert_eq!(panic_message(static_payload.as_ref()), "boom");
        assert_eq!(panic_message(owned_payload.as_ref()), "bang");
        assert_eq!(
            panic_message(other_payload.as_ref()),
            "panic with non-string payload"
        );
    }
}
