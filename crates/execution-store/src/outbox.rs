use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::Result;

/// An event written to the outbox, awaiting relay to the message broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        topic: impl Into<String>,
        partition_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            partition_key: partition_key.into(),
            payload,
            created_at: Utc::now(),
            dispatched_at: None,
        }
    }
}

/// Durable outbox table.
///
/// The engine only appends. `pending` and `mark_dispatched` are the relay
/// API: an external relay process polls them to forward messages to the
/// broker, so nothing in this workspace calls them outside tests.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Appends a message.
    async fn append(&self, message: OutboxMessage) -> Result<()>;

    /// Returns up to `limit` undispatched messages, oldest first. Relay side.
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    /// Marks messages as relayed. Relay side.
    async fn mark_dispatched(&self, ids: &[Uuid]) -> Result<()>;
}

/// In-memory outbox for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    messages: Arc<RwLock<Vec<OutboxMessage>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every message ever appended.
    pub async fn messages(&self) -> Vec<OutboxMessage> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, message: OutboxMessage) -> Result<()> {
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.dispatched_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, ids: &[Uuid]) -> Result<()> {
        let now = Utc::now();
        let mut messages = self.messages.write().await;
        for message in messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.dispatched_at.get_or_insert(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_excludes_dispatched() {
        let outbox = InMemoryOutboxStore::new();
        let first = OutboxMessage::new("workflow-events", "exec-1", serde_json::json!({"n": 1}));
        let second = OutboxMessage::new("workflow-events", "exec-1", serde_json::json!({"n": 2}));
        let first_id = first.id;

        outbox.append(first).await.unwrap();
        outbox.append(second).await.unwrap();
        outbox.mark_dispatched(&[first_id]).await.unwrap();

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["n"], 2);
    }

    #[tokio::test]
    async fn pending_respects_limit() {
        let outbox = InMemoryOutboxStore::new();
        for n in 0..5 {
            outbox
                .append(OutboxMessage::new("t", "k", serde_json::json!(n)))
                .await
                .unwrap();
        }
        assert_eq!(outbox.pending(3).await.unwrap().len(), 3);
    }
}
