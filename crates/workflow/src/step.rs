//! Step abstraction: a forward action plus an optional compensation.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::events::WorkflowEvent;

/// The forward action of a step.
#[async_trait]
pub trait StepAction<I, O>: Send + Sync {
    async fn run(&self, input: I, ctx: &ExecutionContext) -> Result<O, StepError>;
}

/// Undoes a completed step.
///
/// Receives the step's serialized output. Implementations must be
/// idempotent; a failure is logged and never replaces the original error.
#[async_trait]
pub trait Compensation: Send + Sync {
    async fn compensate(
        &self,
        output: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<(), StepError>;
}

struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<I, O, F, Fut> StepAction<I, O> for FnAction<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, StepError>> + Send + 'static,
{
    async fn run(&self, input: I, _ctx: &ExecutionContext) -> Result<O, StepError> {
        (self.f)(input).await
    }
}

struct FnCompensation<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Compensation for FnCompensation<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    async fn compensate(
        &self,
        output: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<(), StepError> {
        (self.f)(output).await
    }
}

/// A named, invocable unit of work.
pub struct Step<I, O> {
    name: String,
    action: Arc<dyn StepAction<I, O>>,
    compensation: Option<Arc<dyn Compensation>>,
    compensation_key: Option<String>,
}

impl<I, O> Clone for Step<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            action: self.action.clone(),
            compensation: self.compensation.clone(),
            compensation_key: self.compensation_key.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for Step<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("compensable", &self.compensation.is_some())
            .field("compensation_key", &self.compensation_key)
            .finish()
    }
}

impl<I, O> Step<I, O>
where
    I: Serialize + Send + 'static,
    O: Serialize + Send + 'static,
{
    /// Creates a step from an action.
    pub fn new(name: impl Into<String>, action: Arc<dyn StepAction<I, O>>) -> Self {
        Self {
            name: name.into(),
            action,
            compensation: None,
            compensation_key: None,
        }
    }

    /// Creates a step from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StepError>> + Send + 'static,
    {
        Self::new(name, Arc::new(FnAction { f }))
    }

    /// Attaches a compensation.
    pub fn with_compensation(mut self, compensation: impl Compensation + 'static) -> Self {
        self.compensation = Some(Arc::new(compensation));
        self
    }

    /// Attaches a compensation built from an async closure over the step output.
    pub fn with_compensation_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.with_compensation(FnCompensation { f })
    }

    /// Stores the step's output in context metadata under `key` on success.
    pub fn with_compensation_key(mut self, key: impl Into<String>) -> Self {
        self.compensation_key = Some(key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    /// Runs the step, emitting started/completed/failed events through `ctx`.
    #[tracing::instrument(skip_all, fields(step = %self.name, execution_id = %ctx.execution_id()))]
    pub async fn invoke(&self, input: I, ctx: &mut ExecutionContext) -> Result<O, StepError> {
        if ctx.is_cancelled() {
            return Err(StepError::cancelled(&self.name));
        }

        let step_index = ctx.step_index() as i32;
        let total_steps = ctx.total_steps().map(|n| n as i32);
        let input_data = serde_json::to_value(&input).ok();

        ctx.publish(WorkflowEvent::step_started(
            &self.name,
            step_index,
            total_steps,
            input_data,
        ))
        .await;

        let started = Instant::now();
        let result = self.action.run(input, ctx).await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as i64;

        metrics::histogram!(
            "workflow_step_duration_seconds",
            "workflow" => ctx.workflow_name().to_string(),
            "step" => self.name.clone()
        )
        .record(elapsed.as_secs_f64());

        match result {
            Ok(output) => {
                let output_data = serde_json::to_value(&output).ok();
                ctx.publish(WorkflowEvent::step_completed(
                    &self.name,
                    step_index,
                    total_steps,
                    output_data.clone(),
                    duration_ms,
                ))
                .await;

                let output_json = output_data.unwrap_or(serde_json::Value::Null);
                if let Some(key) = &self.compensation_key {
                    ctx.insert_metadata(key.clone(), output_json.clone());
                }
                ctx.record_step(
                    &self.name,
                    self.compensation
                        .clone()
                        .map(|compensation| (compensation, output_json)),
                );

                tracing::debug!(duration_ms, "step completed");
                Ok(output)
            }
            Err(e) => {
                let e = e.in_step(&self.name);
                ctx.publish(WorkflowEvent::step_failed(
                    &self.name,
                    step_index,
                    total_steps,
                    &e.error_type,
                    &e.message,
                    duration_ms,
                ))
                .await;

                tracing::warn!(duration_ms, error = %e, "step failed");
                Err(e)
            }
        }
    }
}
