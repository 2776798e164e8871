//! HTTP route handlers.

pub mod events;
pub mod executions;
pub mod health;
pub mod metrics;
pub mod workflows;

use common::ExecutionId;

use crate::error::ApiError;

fn parse_execution_id(id: &str) -> Result<ExecutionId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid execution id '{id}': {e}")))
}
