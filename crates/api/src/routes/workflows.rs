//! Registered workflows, their executions and statistics.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Duration, Utc};
use execution_store::{ExecutionRecord, ExecutionStatistics, Page, PageRequest};
use serde::Deserialize;
use workflow::{Outcome, WorkflowInfo, WorkflowOptions};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<usize>,
    pub size: Option<usize>,
}

impl PageParams {
    fn into_request(self) -> PageRequest {
        let defaults = PageRequest::default();
        PageRequest::new(
            self.page.unwrap_or(defaults.page),
            self.size.unwrap_or(defaults.size),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    /// RFC 3339 lower bound on `created_at`. Defaults to 24 hours ago.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    #[serde(default)]
    pub input: serde_json::Value,
    pub correlation_id: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub lock_key: Option<String>,
}

/// GET /workflows: registered workflows sorted by name.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<WorkflowInfo>> {
    Json(state.engine.list_workflows().await)
}

/// POST /workflows/:name/executions: runs a registered workflow and returns its outcome.
#[tracing::instrument(skip(state, req))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<Json<Outcome<serde_json::Value>>, ApiError> {
    let mut options = WorkflowOptions::new();
    if let Some(correlation_id) = req.correlation_id {
        options = options.correlation_id(correlation_id);
    }
    if let Some(secs) = req.timeout_seconds {
        options = options.timeout(std::time::Duration::from_secs(secs));
    }
    if let Some(lock_key) = req.lock_key {
        options = options.lock_key(lock_key);
    }

    let outcome = state.engine.execute_json(&name, req.input, options).await?;
    Ok(Json(outcome))
}

/// GET /workflows/:name/executions: newest executions first.
#[tracing::instrument(skip(state))]
pub async fn executions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<ExecutionRecord>>, ApiError> {
    let page = state
        .engine
        .find_executions_by_workflow(&name, params.into_request())
        .await?;
    Ok(Json(page))
}

/// GET /workflows/:name/statistics: status counts since a point in time.
#[tracing::instrument(skip(state))]
pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<StatisticsParams>,
) -> Result<Json<ExecutionStatistics>, ApiError> {
    let since = params
        .since
        .unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let stats = state.engine.get_statistics(&name, since).await?;
    Ok(Json(stats))
}
