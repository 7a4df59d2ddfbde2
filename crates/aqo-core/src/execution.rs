//! Execution lifecycle types.
//!
//! An [`Execution`] tracks one `(query, collector)` attempt inside a
//! collection run. Legal transitions are `pending -> running -> completed`
//! and `pending -> running -> failed`; anything else is a corrective
//! force-transition performed by the verifier.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::query::CollectorType;
use crate::CoreError;

/// Reason attached to executions that the periodic sweep fails for staleness.
pub const TIMED_OUT_NO_RESULT: &str = "timed out with no result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether `self -> next` is a normal (non-corrective) transition.
    #[must_use]
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (
                    ExecutionStatus::Running,
                    ExecutionStatus::Completed | ExecutionStatus::Failed
                )
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Failure classification carried by a `failed` execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ProviderTimeout,
    ProviderRateLimited,
    ProviderHardError,
    ProviderUnavailable,
    AsyncJobFailed,
    AsyncJobAbandoned,
    CapturedFailure,
    NoProviders,
    TimedOutNoResult,
    PersistenceFailure,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::ProviderTimeout => "provider_timeout",
            ErrorClass::ProviderRateLimited => "provider_rate_limited",
            ErrorClass::ProviderHardError => "provider_hard_error",
            ErrorClass::ProviderUnavailable => "provider_unavailable",
            ErrorClass::AsyncJobFailed => "async_job_failed",
            ErrorClass::AsyncJobAbandoned => "async_job_abandoned",
            ErrorClass::CapturedFailure => "captured_failure",
            ErrorClass::NoProviders => "no_providers",
            ErrorClass::TimedOutNoResult => "timed_out_no_result",
            ErrorClass::PersistenceFailure => "persistence_failure",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, human-readable reason stored on a `failed` execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub provider: Option<String>,
    pub class: ErrorClass,
    pub message: String,
}

impl ExecutionError {
    #[must_use]
    pub fn new(provider: Option<&str>, class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            provider: provider.map(str::to_string),
            class,
            message: message.into(),
        }
    }

    /// The sweep's staleness failure, distinguishable from provider failures.
    #[must_use]
    pub fn timed_out_no_result() -> Self {
        Self::new(None, ErrorClass::TimedOutNoResult, TIMED_OUT_NO_RESULT)
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.provider {
            Some(p) => write!(f, "{p} ({}): {}", self.class, self.message),
            None => write!(f, "{}: {}", self.class, self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub run_id: Uuid,
    pub query_id: Uuid,
    pub collector_type: CollectorType,
    pub status: ExecutionStatus,
    pub result_id: Option<Uuid>,
    pub error: Option<ExecutionError>,
    /// Incremented on every successful compare-and-swap.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What `get_execution_status` reports to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStatusView {
    pub status: ExecutionStatus,
    pub result_id: Option<Uuid>,
    pub error: Option<ExecutionError>,
}

impl From<&Execution> for ExecutionStatusView {
    fn from(e: &Execution) -> Self {
        Self {
            status: e.status,
            result_id: e.result_id,
            error: e.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_only() {
        use ExecutionStatus::{Completed, Failed, Pending, Running};
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn status_parses_from_db_text() {
        assert_eq!(
            "running".parse::<ExecutionStatus>().unwrap(),
            ExecutionStatus::Running
        );
        assert!("queued".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn timed_out_reason_is_distinguishable() {
        let err = ExecutionError::timed_out_no_result();
        assert_eq!(err.class, ErrorClass::TimedOutNoResult);
        assert_eq!(err.message, "timed out with no result");
        assert!(err.provider.is_none());
    }

    #[test]
    fn error_display_includes_provider_and_class() {
        let err = ExecutionError::new(
            Some("openai-responses"),
            ErrorClass::ProviderTimeout,
            "deadline exceeded",
        );
        assert_eq!(
            err.to_string(),
            "openai-responses (provider_timeout): deadline exceeded"
        );
    }

    #[test]
    fn error_serializes_class_as_snake_case() {
        let err = ExecutionError::new(None, ErrorClass::AsyncJobAbandoned, "gave up");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["class"], "async_job_abandoned");
    }
}
