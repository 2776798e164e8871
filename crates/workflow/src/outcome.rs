//! Two-case result returned by every workflow run.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::error::StepError;

/// Why a workflow run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The workflow deliberately returned a failure.
    Business,
    /// A step raised an unexpected error or the body panicked.
    Exception,
    /// The run exceeded its timeout.
    Timeout,
    /// The run stopped because the execution was cancelled.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Business => "BUSINESS",
            FailureKind::Exception => "EXCEPTION",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Details of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub error_type: String,
    pub message: String,
    /// The step that failed, when known.
    pub step: Option<String>,
}

impl Failure {
    /// A deliberate business failure.
    pub fn business(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Business,
            error_type: error_type.into(),
            message: message.into(),
            step: None,
        }
    }

    /// An unexpected error that did not come from a step.
    pub fn exception(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Exception,
            error_type: error_type.into(),
            message: message.into(),
            step: None,
        }
    }

    /// The failure recorded when a run exceeds `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            error_type: "Timeout".to_string(),
            message: format!("workflow timed out after {timeout:?}"),
            step: None,
        }
    }

    /// Attaches the failing step.
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn is_business(&self) -> bool {
        self.kind == FailureKind::Business
    }
}

impl From<StepError> for Failure {
    fn from(error: StepError) -> Self {
        let kind = if error.is_cancelled() {
            FailureKind::Cancelled
        } else {
            FailureKind::Exception
        };
        Self {
            kind,
            error_type: error.error_type,
            message: error.message,
            step: error.step,
        }
    }
}

/// `Success(data)` or `Failure(failure)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome<T> {
    Success(T),
    Failure(Failure),
}

impl<T> Outcome<T> {
    /// Shorthand for a business failure.
    pub fn fail(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Failure(Failure::business(error_type, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// Returns the success value, discarding any failure.
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// Returns the failure, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Failure(failure) => Outcome::Failure(failure),
        }
    }

    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }
}

impl<T: Serialize> Outcome<T> {
    /// Serializes the success value.
    pub fn into_json(self) -> Result<Outcome<serde_json::Value>, serde_json::Error> {
        Ok(match self {
            Outcome::Success(value) => Outcome::Success(serde_json::to_value(value)?),
            Outcome::Failure(failure) => Outcome::Failure(failure),
        })
    }
}

impl Outcome<serde_json::Value> {
    /// Deserializes the success value.
    pub fn from_json<T: DeserializeOwned>(self) -> Result<Outcome<T>, serde_json::Error> {
        Ok(match self {
            Outcome::Success(value) => Outcome::Success(serde_json::from_value(value)?),
            Outcome::Failure(failure) => Outcome::Failure(failure),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_step_error_becomes_cancelled_failure() {
        let failure: Failure = StepError::cancelled("reserve").into();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.step.as_deref(), Some("reserve"));
    }

    #[test]
    fn step_error_becomes_exception() {
        let failure: Failure = StepError::new("Io", "disk full").in_step("write").into();
        assert_eq!(failure.kind, FailureKind::Exception);
        assert!(!failure.is_business());
    }

    #[test]
    fn json_conversion_preserves_failure() {
        let outcome: Outcome<u32> = Outcome::fail("OutOfStock", "no widgets");
        let json = outcome.into_json().unwrap();
        assert_eq!(json.failure().unwrap().error_type, "OutOfStock");

        let back: Outcome<u32> = Outcome::Success(serde_json::json!(7)).from_json().unwrap();
        assert_eq!(back.success(), Some(7));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome: Outcome<String> = Outcome::Success("ok".to_string());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(json["value"], "ok");
    }
}
