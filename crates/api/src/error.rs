//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use execution_store::ExecutionStoreError;
use thiserror::Error;
use workflow::WorkflowError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// Engine error.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Workflow(err) => workflow_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn workflow_error_to_response(err: WorkflowError) -> (StatusCode, String) {
    match &err {
        WorkflowError::NotFound(_) | WorkflowError::ExecutionNotFound(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        WorkflowError::TypeMismatch { .. } | WorkflowError::Serialization(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        WorkflowError::IllegalState(_)
        | WorkflowError::InProgress { .. }
        | WorkflowError::IdempotencyConflict { .. }
        | WorkflowError::LockNotAcquired { .. } => (StatusCode::CONFLICT, err.to_string()),
        WorkflowError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, err.to_string()),
        WorkflowError::Store(_) => {
            tracing::error!(error = %err, "execution store error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

impl From<ExecutionStoreError> for ApiError {
    fn from(err: ExecutionStoreError) -> Self {
        ApiError::Workflow(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ExecutionId;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_engine_errors_map_to_status_codes() {
        assert_eq!(
            status_of(WorkflowError::ExecutionNotFound(ExecutionId::new()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(WorkflowError::IllegalState("not paused".to_string()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(
                WorkflowError::LockNotAcquired {
                    key: "entity:42".to_string()
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(ApiError::BadRequest("bad id".to_string())),
            StatusCode::BAD_REQUEST
        );
    }
}
