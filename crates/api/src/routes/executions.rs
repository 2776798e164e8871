//! Execution inspection and operator actions.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use execution_store::{ExecutionRecord, StepEventRecord};
use workflow::Outcome;

use super::parse_execution_id;
use crate::AppState;
use crate::error::ApiError;

/// GET /executions/:id
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    state
        .engine
        .get_execution(execution_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Execution {id} not found")))
}

/// GET /executions/:id/steps: step rows ordered by index.
#[tracing::instrument(skip(state))]
pub async fn steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StepEventRecord>>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    Ok(Json(state.engine.get_step_events(execution_id).await?))
}

/// POST /executions/:id/retry: re-runs a failed execution as a child.
#[tracing::instrument(skip(state))]
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Outcome<serde_json::Value>>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    Ok(Json(state.engine.retry_execution(execution_id).await?))
}

/// POST /executions/:id/pause
#[tracing::instrument(skip(state))]
pub async fn pause(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    Ok(Json(state.engine.pause_execution(execution_id).await?))
}

/// POST /executions/:id/resume: re-runs the stored input under the same id.
#[tracing::instrument(skip(state))]
pub async fn resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Outcome<serde_json::Value>>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    Ok(Json(state.engine.resume_execution(execution_id).await?))
}

/// POST /executions/:id/cancel
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionRecord>, ApiError> {
    let execution_id = parse_execution_id(&id)?;
    Ok(Json(state.engine.cancel_execution(execution_id).await?))
}
