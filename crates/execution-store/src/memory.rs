use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    ExecutionId, ExecutionRecord, ExecutionStatistics, ExecutionStatus, ExecutionStoreError,
    NewExecution, NewStepEvent, Page, PageRequest, Result, StepEventRecord, StepStart,
    StepTermination,
    store::{ExecutionStore, IdempotencyClaim, StepEventStore},
};

/// In-memory execution store for testing.
///
/// Provides the same interface and constraint behavior as the PostgreSQL
/// implementation: the idempotency key is unique per workflow and step
/// rows are unique per `(execution_id, attempt, step_index)`.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    executions: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
    steps: Arc<RwLock<BTreeMap<StepKey, StepEventRecord>>>,
}

impl InMemoryExecutionStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of executions stored.
    pub async fn execution_count(&self) -> usize {
        self.executions.read().await.len()
    }

    /// Returns the total number of step rows stored.
    pub async fn step_event_count(&self) -> usize {
        self.steps.read().await.len()
    }

    /// Clears all executions and step rows.
    pub async fn clear(&self) {
        self.executions.write().await.clear();
        self.steps.write().await.clear();
    }

    async fn update<F>(&self, id: ExecutionId, mutate: F) -> Result<ExecutionRecord>
    where
        F: FnOnce(&mut ExecutionRecord) -> Result<()> + Send,
    {
        let mut executions = self.executions.write().await;
        let record = executions
            .get_mut(&id)
            .ok_or(ExecutionStoreError::ExecutionNotFound(id))?;

        // Mutate a copy so a rejected transition leaves the stored row untouched
        let mut updated = record.clone();
        mutate(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }
}

type StepKey = (ExecutionId, i32, i32);

fn step_range(execution_id: ExecutionId) -> std::ops::RangeInclusive<StepKey> {
    (execution_id, i32::MIN, i32::MIN)..=(execution_id, i32::MAX, i32::MAX)
}

fn key_matches(record: &ExecutionRecord, key: &str, workflow_name: &str) -> bool {
    record.workflow_name == workflow_name && record.idempotency_key.as_deref() == Some(key)
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, execution: NewExecution) -> Result<ExecutionRecord> {
        let mut executions = self.executions.write().await;

        if let Some(key) = execution.idempotency_key.as_deref()
            && executions
                .values()
                .any(|r| key_matches(r, key, &execution.workflow_name))
        {
            return Err(ExecutionStoreError::IdempotencyConflict {
                key: key.to_string(),
                workflow_name: execution.workflow_name,
            });
        }

        let record = execution.into_record();
        executions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn complete_execution(
        &self,
        id: ExecutionId,
        result: serde_json::Value,
    ) -> Result<ExecutionRecord> {
        self.update(id, |record| record.mark_completed(result))
            .await
    }

    async fn fail_execution(&self, id: ExecutionId, error: &str) -> Result<ExecutionRecord> {
        self.update(id, |record| record.mark_failed(error)).await
    }

    async fn compensate_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update(id, |record| record.transition(ExecutionStatus::Compensated))
            .await
    }

    async fn retry_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update(id, |record| record.consume_retry()).await
    }

    async fn pause_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update(id, |record| record.transition(ExecutionStatus::Paused))
            .await
    }

    async fn resume_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update(id, |record| record.resume()).await
    }

    async fn cancel_execution(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.update(id, |record| record.transition(ExecutionStatus::Cancelled))
            .await
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn find_executions_by_workflow(
        &self,
        workflow_name: &str,
        page: PageRequest,
    ) -> Result<Page<ExecutionRecord>> {
        let executions = self.executions.read().await;
        let mut matching: Vec<_> = executions
            .values()
            .filter(|r| r.workflow_name == workflow_name)
            .cloned()
            .collect();

        // Newest first
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn get_statistics(
        &self,
        workflow_name: &str,
        since: DateTime<Utc>,
    ) -> Result<ExecutionStatistics> {
        let executions = self.executions.read().await;
        let mut stats = ExecutionStatistics {
            workflow_name: workflow_name.to_string(),
            since: Some(since),
            ..Default::default()
        };

        let mut durations = Vec::new();
        for record in executions
            .values()
            .filter(|r| r.workflow_name == workflow_name && r.created_at >= since)
        {
            stats.count(record.status, 1);
            if let Some(duration) = record.duration() {
                durations.push(duration.num_milliseconds() as f64);
            }
        }

        if !durations.is_empty() {
            stats.average_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
        workflow_name: &str,
    ) -> Result<Option<ExecutionRecord>> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .find(|r| key_matches(r, key, workflow_name))
            .cloned())
    }

    async fn claim_idempotency_key(&self, execution: NewExecution) -> Result<IdempotencyClaim> {
        let Some(key) = execution.idempotency_key.clone() else {
            return Ok(IdempotencyClaim::Started(
                self.create_execution(execution).await?,
            ));
        };

        // The write lock plays the role of the row lock
        let mut executions = self.executions.write().await;
        let existing = executions
            .values_mut()
            .find(|r| key_matches(r, &key, &execution.workflow_name));

        match existing {
            Some(record) if record.status == ExecutionStatus::Completed => {
                Ok(IdempotencyClaim::Completed(record.clone()))
            }
            Some(record) if record.status.is_resettable() => {
                record.reset_for_resubmission()?;
                Ok(IdempotencyClaim::Resumed(record.clone()))
            }
            Some(record) if record.status == ExecutionStatus::Cancelled => {
                Ok(IdempotencyClaim::Cancelled(record.clone()))
            }
            Some(record) => Ok(IdempotencyClaim::InProgress(record.clone())),
            None => {
                let record = execution.into_record();
                executions.insert(record.id, record.clone());
                Ok(IdempotencyClaim::Started(record))
            }
        }
    }
}

#[async_trait]
impl StepEventStore for InMemoryExecutionStore {
    async fn record_step_started(&self, event: NewStepEvent) -> Result<StepStart> {
        let mut steps = self.steps.write().await;
        let key = (event.execution_id, event.attempt, event.step_index);

        if let Some(existing) = steps.get(&key) {
            return Ok(StepStart::Existing(existing.clone()));
        }

        let record = event.into_record();
        steps.insert(key, record.clone());
        Ok(StepStart::Inserted(record))
    }

    async fn record_step_finished(
        &self,
        termination: StepTermination,
    ) -> Result<StepEventRecord> {
        let mut steps = self.steps.write().await;
        let key = (
            termination.execution_id,
            termination.attempt,
            termination.step_index,
        );

        match steps.get_mut(&key) {
            Some(existing) if existing.status.is_terminal() => {
                Err(ExecutionStoreError::StepAlreadyFinalized {
                    execution_id: termination.execution_id,
                    step_index: termination.step_index,
                    status: existing.status,
                })
            }
            Some(existing) => {
                termination.apply_to(existing);
                Ok(existing.clone())
            }
            None => {
                let record = termination.into_record();
                steps.insert(key, record.clone());
                Ok(record)
            }
        }
    }

    async fn get_step_event(
        &self,
        execution_id: ExecutionId,
        attempt: i32,
        step_index: i32,
    ) -> Result<Option<StepEventRecord>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&(execution_id, attempt, step_index))
            .cloned())
    }

    async fn get_step_events(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>> {
        let steps = self.steps.read().await;
        let Some(((_, latest, _), _)) = steps.range(step_range(execution_id)).next_back() else {
            return Ok(Vec::new());
        };
        let latest = *latest;
        Ok(steps
            .range((execution_id, latest, i32::MIN)..=(execution_id, latest, i32::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn get_step_history(&self, execution_id: ExecutionId) -> Result<Vec<StepEventRecord>> {
        let steps = self.steps.read().await;
        Ok(steps
            .range(step_range(execution_id))
            .map(|(_, record)| record.clone())
            .collect())
    }
}
