//! Dual-sink event publisher with idempotent step persistence.
//!
//! Every event goes to a durable sink and a real-time sink. Step events are
//! also written to the step store, where starts are deduplicated on
//! `(execution_id, step_index)` and terminal writes use optimistic
//! concurrency. Nothing here ever fails the workflow: sink and store
//! errors are logged and counted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use execution_store::{
    ExecutionId, NewStepEvent, OutboxMessage, OutboxStore, StepEventStore, StepStart,
    StepStatus, StepTermination,
};
use tokio::sync::{RwLock, broadcast};

use crate::error::PublishError;
use crate::events::{EventEnvelope, EventSource, WorkflowEvent};

/// Durable, partitioned event sink (message broker, outbox, audit log).
#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError>;
}

/// Real-time fan-out to live observers.
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn broadcast(&self, topic: &str, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

/// Publishes lifecycle events to the configured sinks.
pub struct EventPublisher {
    topic: String,
    durable: Option<Arc<dyn DurableSink>>,
    realtime: Option<Arc<dyn RealtimeSink>>,
    steps: Option<Arc<dyn StepEventStore>>,
}

impl EventPublisher {
    /// Creates a publisher with no sinks attached.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            durable: None,
            realtime: None,
            steps: None,
        }
    }

    pub fn with_durable_sink(mut self, sink: Arc<dyn DurableSink>) -> Self {
        self.durable = Some(sink);
        self
    }

    pub fn with_realtime_sink(mut self, sink: Arc<dyn RealtimeSink>) -> Self {
        self.realtime = Some(sink);
        self
    }

    pub fn with_step_store(mut self, store: Arc<dyn StepEventStore>) -> Self {
        self.steps = Some(store);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes `event` for `source`.
    pub async fn publish(&self, source: &EventSource, event: WorkflowEvent) {
        let envelope = EventEnvelope::new(source, &event);

        if !event.is_broadcast_only() {
            self.persist_step(source, &event).await;

            if let Some(durable) = &self.durable
                && let Err(e) = durable
                    .publish(&self.topic, &envelope.partition_key(), &envelope)
                    .await
            {
                publish_failed(source, &envelope, "durable", &e);
            }
        }

        if let Some(realtime) = &self.realtime
            && let Err(e) = realtime.broadcast(&self.topic, &envelope).await
        {
            publish_failed(source, &envelope, "realtime", &e);
        }
    }

    async fn persist_step(&self, source: &EventSource, event: &WorkflowEvent) {
        let Some(steps) = &self.steps else {
            return;
        };

        match event {
            WorkflowEvent::StepStarted(data) => {
                let started = steps
                    .record_step_started(NewStepEvent {
                        execution_id: source.execution_id,
                        attempt: source.attempt,
                        workflow_name: source.workflow_name.clone(),
                        step_name: data.step_name.clone(),
                        step_index: data.step_index,
                        total_steps: data.total_steps,
                        input_data: data.input.clone(),
                        started_at: Utc::now(),
                    })
                    .await;

                match started {
                    Ok(StepStart::Existing(_)) => {
                        tracing::debug!(
                            execution_id = %source.execution_id,
                            step = %data.step_name,
                            step_index = data.step_index,
                            "duplicate step start reused existing row"
                        );
                    }
                    Ok(StepStart::Inserted(_)) => {}
                    Err(e) => step_persist_failed(source, &data.step_name, &e),
                }
            }
            WorkflowEvent::StepCompleted(data) => {
                self.finish_step(
                    steps.as_ref(),
                    StepTermination {
                        execution_id: source.execution_id,
                        attempt: source.attempt,
                        workflow_name: source.workflow_name.clone(),
                        step_name: data.step_name.clone(),
                        step_index: data.step_index,
                        total_steps: data.total_steps,
                        status: StepStatus::Completed,
                        output_data: data.output.clone(),
                        error_message: None,
                        error_type: None,
                        duration_ms: data.duration_ms,
                        completed_at: Utc::now(),
                    },
                )
                .await;
            }
            WorkflowEvent::StepFailed(data) => {
                self.finish_step(
                    steps.as_ref(),
                    StepTermination {
                        execution_id: source.execution_id,
                        attempt: source.attempt,
                        workflow_name: source.workflow_name.clone(),
                        step_name: data.step_name.clone(),
                        step_index: data.step_index,
                        total_steps: data.total_steps,
                        status: StepStatus::Failed,
                        output_data: None,
                        error_message: Some(data.error.clone()),
                        error_type: Some(data.error_type.clone()),
                        duration_ms: data.duration_ms,
                        completed_at: Utc::now(),
                    },
                )
                .await;
            }
            _ => {}
        }
    }

    async fn finish_step(&self, steps: &dyn StepEventStore, termination: StepTermination) {
        let execution_id = termination.execution_id;
        let step_index = termination.step_index;
        let attempted = termination.status;

        match steps.record_step_finished(termination).await {
            Ok(_) => {}
            Err(e) if e.is_lost_race() => {
                tracing::warn!(
                    %execution_id,
                    step_index,
                    %attempted,
                    error = %e,
                    "step finalization lost to a concurrent writer"
                );
            }
            Err(e) => {
                metrics::counter!("workflow_event_publish_failures_total", "sink" => "step_store")
                    .increment(1);
                tracing::warn!(%execution_id, step_index, error = %e, "failed to persist step result");
            }
        }
    }
}

fn publish_failed(
    source: &EventSource,
    envelope: &EventEnvelope,
    sink: &'static str,
    error: &PublishError,
) {
    metrics::counter!(
        "workflow_event_publish_failures_total",
        "workflow" => source.workflow_name.clone(),
        "sink" => sink
    )
    .increment(1);
    tracing::warn!(
        execution_id = %source.execution_id,
        event_type = %envelope.event_type,
        sink,
        %error,
        "failed to publish workflow event"
    );
}

fn step_persist_failed(
    source: &EventSource,
    step: &str,
    error: &execution_store::ExecutionStoreError,
) {
    metrics::counter!(
        "workflow_event_publish_failures_total",
        "workflow" => source.workflow_name.clone(),
        "sink" => "step_store"
    )
    .increment(1);
    tracing::warn!(
        execution_id = %source.execution_id,
        step,
        %error,
        "failed to persist step start"
    );
}

/// Durable sink that keeps envelopes in memory, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDurableSink {
    published: Arc<RwLock<Vec<(String, String, EventEnvelope)>>>,
}

impl InMemoryDurableSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every envelope published, in order.
    pub async fn envelopes(&self) -> Vec<EventEnvelope> {
        self.published
            .read()
            .await
            .iter()
            .map(|(_, _, envelope)| envelope.clone())
            .collect()
    }

    /// Returns the envelopes published for one execution, in order.
    pub async fn envelopes_for(&self, execution_id: ExecutionId) -> Vec<EventEnvelope> {
        self.published
            .read()
            .await
            .iter()
            .filter(|(_, _, envelope)| envelope.execution_id == execution_id)
            .map(|(_, _, envelope)| envelope.clone())
            .collect()
    }

    /// Returns the event types published for one execution, in order.
    pub async fn event_types_for(&self, execution_id: ExecutionId) -> Vec<String> {
        self.envelopes_for(execution_id)
            .await
            .into_iter()
            .map(|envelope| envelope.event_type)
            .collect()
    }
}

#[async_trait]
impl DurableSink for InMemoryDurableSink {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        self.published.write().await.push((
            topic.to_string(),
            partition_key.to_string(),
            envelope.clone(),
        ));
        Ok(())
    }
}

/// Durable sink that appends envelopes to an outbox for later relay.
#[derive(Clone)]
pub struct OutboxSink {
    outbox: Arc<dyn OutboxStore>,
}

impl OutboxSink {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl DurableSink for OutboxSink {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_value(envelope)?;
        self.outbox
            .append(OutboxMessage::new(topic, partition_key, payload))
            .await?;
        Ok(())
    }
}

/// Real-time sink over a tokio broadcast channel.
///
/// Sending with no subscribers is not an error; slow subscribers lag and
/// drop the oldest envelopes.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl RealtimeSink for BroadcastSink {
    async fn broadcast(&self, _topic: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }
}
