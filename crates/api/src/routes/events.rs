//! Live event stream over Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use common::ExecutionId;
use futures_util::Stream;
use futures_util::stream;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use workflow::EventEnvelope;

use super::parse_execution_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Only forward events of this execution.
    pub execution_id: Option<String>,
}

/// GET /events: streams envelopes as they are published.
///
/// Slow clients that fall behind the broadcast buffer skip the missed
/// events and keep streaming.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<EventFilter>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let execution_id = filter
        .execution_id
        .as_deref()
        .map(parse_execution_id)
        .transpose()?;

    metrics::counter!("api_event_stream_connections_total").increment(1);
    let receiver = state.live.subscribe();

    Ok(Sse::new(envelope_stream(receiver, execution_id)).keep_alive(KeepAlive::default()))
}

fn envelope_stream(
    receiver: broadcast::Receiver<EventEnvelope>,
    execution_id: Option<ExecutionId>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    if execution_id.is_some_and(|id| id != envelope.execution_id) {
                        continue;
                    }
                    match to_sse_event(&envelope) {
                        Some(event) => return Some((Ok(event), receiver)),
                        None => continue,
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

fn to_sse_event(envelope: &EventEnvelope) -> Option<Event> {
    match Event::default()
        .event(envelope.event_type.as_str())
        .id(envelope.event_id.to_string())
        .json_data(envelope)
    {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(event_id = %envelope.event_id, error = %e, "failed to encode event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use workflow::{EventSource, WorkflowEvent};

    fn envelope(execution_id: ExecutionId) -> EventEnvelope {
        let source = EventSource {
            execution_id,
            workflow_name: "checkout".to_string(),
            correlation_id: None,
            parent_execution_id: None,
            attempt: 0,
        };
        EventEnvelope::new(&source, &WorkflowEvent::workflow_started(serde_json::json!({})))
    }

    #[tokio::test]
    async fn test_stream_filters_by_execution() {
        let (sender, receiver) = broadcast::channel(16);
        let wanted = ExecutionId::new();
        let stream = envelope_stream(receiver, Some(wanted));
        tokio::pin!(stream);

        sender.send(envelope(ExecutionId::new())).unwrap();
        sender.send(envelope(wanted)).unwrap();
        drop(sender);

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_survives_lag() {
        let (sender, receiver) = broadcast::channel(2);
        let stream = envelope_stream(receiver, None);
        tokio::pin!(stream);

        for _ in 0..5 {
            sender.send(envelope(ExecutionId::new())).unwrap();
        }
        drop(sender);

        let mut received = 0;
        while stream.next().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
