//! Name-keyed workflow registry with type-erased runners.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use execution_store::ExecutionRecord;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::config::{ResolvedOptions, WorkflowOptions};
use crate::context::ExecutionContext;
use crate::engine::WorkflowEngine;
use crate::error::{Result, WorkflowError};
use crate::outcome::Outcome;
use crate::workflow::Workflow;

/// Public description of a registered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
}

/// Runs a registered workflow with JSON in and out.
///
/// Used where only the workflow name is known: retries, resumes and the
/// admin API.
#[async_trait]
pub(crate) trait ErasedWorkflow: Send + Sync {
    async fn execute_json(
        &self,
        engine: &WorkflowEngine,
        input: serde_json::Value,
        options: WorkflowOptions,
    ) -> Result<Outcome<serde_json::Value>>;

    /// Re-runs a stored execution under its own id.
    async fn resume_json(
        &self,
        engine: &WorkflowEngine,
        record: ExecutionRecord,
    ) -> Result<Outcome<serde_json::Value>>;
}

struct WorkflowRunner<W> {
    workflow: Arc<W>,
}

#[async_trait]
impl<W> ErasedWorkflow for WorkflowRunner<W>
where
    W: Workflow + 'static,
{
    async fn execute_json(
        &self,
        engine: &WorkflowEngine,
        input: serde_json::Value,
        options: WorkflowOptions,
    ) -> Result<Outcome<serde_json::Value>> {
        let input: W::Input = serde_json::from_value(input)?;
        let outcome = engine
            .execute_workflow(self.workflow.as_ref(), input, None, options)
            .await?;
        Ok(outcome.into_json()?)
    }

    async fn resume_json(
        &self,
        engine: &WorkflowEngine,
        record: ExecutionRecord,
    ) -> Result<Outcome<serde_json::Value>> {
        let input: W::Input = record.input_as()?;
        let options = ResolvedOptions {
            parent_execution_id: record.parent_execution_id,
            correlation_id: record.correlation_id.clone(),
            max_retries: record.max_retries,
            timeout: stored_timeout(&record, engine),
            lock_key: None,
            lock_ttl: engine.config().lock_ttl,
        };
        let outcome = engine
            .run_with_record(
                self.workflow.as_ref(),
                input,
                record,
                ExecutionContext::new(),
                &options,
            )
            .await?;
        Ok(outcome.into_json()?)
    }
}

/// The timeout an execution was created with, or the engine default.
pub(crate) fn stored_timeout(record: &ExecutionRecord, engine: &WorkflowEngine) -> Duration {
    if record.timeout_seconds > 0 {
        Duration::from_secs(record.timeout_seconds as u64)
    } else {
        engine.config().default_timeout
    }
}

/// A registry entry.
pub(crate) struct RegisteredWorkflow {
    info: WorkflowInfo,
    // Holds an `Arc<dyn Workflow<Input = I, Output = O>>`
    typed: Box<dyn Any + Send + Sync>,
    runner: Arc<dyn ErasedWorkflow>,
}

impl RegisteredWorkflow {
    pub(crate) fn new<W: Workflow + 'static>(workflow: W) -> Self {
        let workflow = Arc::new(workflow);
        let typed: Arc<dyn Workflow<Input = W::Input, Output = W::Output>> = workflow.clone();
        Self {
            info: WorkflowInfo {
                name: workflow.name().to_string(),
                input_type: std::any::type_name::<W::Input>().to_string(),
                output_type: std::any::type_name::<W::Output>().to_string(),
            },
            typed: Box::new(typed),
            runner: Arc::new(WorkflowRunner { workflow }),
        }
    }

    pub(crate) fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub(crate) fn runner(&self) -> Arc<dyn ErasedWorkflow> {
        self.runner.clone()
    }

    /// Returns the workflow if it was registered with exactly `I` and `O`.
    pub(crate) fn typed<I, O>(&self) -> Result<Arc<dyn Workflow<Input = I, Output = O>>>
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
    {
        self.typed
            .downcast_ref::<Arc<dyn Workflow<Input = I, Output = O>>>()
            .cloned()
            .ok_or_else(|| WorkflowError::TypeMismatch {
                workflow: self.info.name.clone(),
                expected: format!("{} -> {}", self.info.input_type, self.info.output_type),
                actual: format!(
                    "{} -> {}",
                    std::any::type_name::<I>(),
                    std::any::type_name::<O>()
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;

    struct Echo;

    #[async_trait]
    impl Workflow for Echo {
        type Input = String;
        type Output = String;

        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            input: String,
            _ctx: &mut ExecutionContext,
        ) -> std::result::Result<Outcome<String>, StepError> {
            Ok(Outcome::Success(input))
        }
    }

    #[test]
    fn info_carries_type_names() {
        let entry = RegisteredWorkflow::new(Echo);
        assert_eq!(entry.info().name, "echo");
        assert_eq!(entry.info().input_type, std::any::type_name::<String>());
        assert_eq!(entry.info().output_type, std::any::type_name::<String>());
    }

    #[test]
    fn typed_lookup_checks_both_types() {
        let entry = RegisteredWorkflow::new(Echo);

        assert!(entry.typed::<String, String>().is_ok());
        assert!(matches!(
            entry.typed::<String, u32>(),
            Err(WorkflowError::TypeMismatch { .. })
        ));
        assert!(matches!(
            entry.typed::<u32, String>(),
            Err(WorkflowError::TypeMismatch { .. })
        ));
    }
}
