use crate::security::sql_validator::RejectionReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QaError {
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Generation failure: {0}")]
    Generation(String),

    #[error("Query rejected: {0}")]
    ValidationRejected(RejectionReason),

    #[error("Execution error: {0}")]
    Execution(ExecutionFailure),

    #[error("Grounding failure: {0}")]
    Grounding(String),

    #[error("History write failure: {0}")]
    HistoryWrite(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Deadline exceeded after {0} ms")]
    DeadlineExceeded(u64),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Engine overloaded: {0}")]
    Overloaded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<sqlx::Error> for QaError {
    fn from(err: sqlx::Error) -> Self {
        QaError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for QaError {
    fn from(err: rusqlite::Error) -> Self {
        QaError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QaError>;

/// Sanitized execution failure. Backend text never lands here; it is logged
/// where the failure is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    Timeout,
    PoolExhausted,
    Backend,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::Timeout => write!(f, "the query took too long to complete"),
            ExecutionFailure::PoolExhausted => write!(f, "the data store is busy"),
            ExecutionFailure::Backend => write!(f, "the data store could not complete the query"),
        }
    }
}

/// Public failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RetrievalUnavailable,
    GenerationFailure,
    ValidationRejected,
    ExecutionError,
    GroundingFailure,
    HistoryWriteFailure,
    DeadlineExceeded,
    Cancelled,
    Overloaded,
    InvalidRequest,
    Internal,
}

impl QaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QaError::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            QaError::Llm(_) | QaError::Generation(_) => ErrorKind::GenerationFailure,
            QaError::ValidationRejected(_) => ErrorKind::ValidationRejected,
            QaError::Execution(_) => ErrorKind::ExecutionError,
            QaError::Grounding(_) => ErrorKind::GroundingFailure,
            QaError::HistoryWrite(_) => ErrorKind::HistoryWriteFailure,
            QaError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            QaError::Cancelled => ErrorKind::Cancelled,
            QaError::Overloaded(_) => ErrorKind::Overloaded,
            QaError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            QaError::Schema(_)
            | QaError::Database(_)
            | QaError::Config(_)
            | QaError::Io(_)
            | QaError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether resubmitting the same request may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            QaError::Llm(_) | QaError::Generation(_) => true,
            QaError::Execution(failure) => !matches!(failure, ExecutionFailure::Backend),
            QaError::DeadlineExceeded(_) | QaError::Overloaded(_) => true,
            _ => false,
        }
    }

    /// User-facing message. Never includes backend or model text.
    pub fn public_message(&self) -> String {
        match self {
            QaError::RetrievalUnavailable(_) => {
                "Reference material is temporarily unavailable.".to_string()
            }
            QaError::Llm(_) | QaError::Generation(_) => {
                "The question could not be translated into a query right now.".to_string()
            }
            QaError::ValidationRejected(_) => {
                "This question cannot be answered safely: no safe read-only query could be produced."
                    .to_string()
            }
            QaError::Execution(failure) => format!("The data could not be retrieved: {}.", failure),
            QaError::Grounding(_) => {
                "This question cannot be answered verifiably from the available data.".to_string()
            }
            QaError::HistoryWrite(_) => "The answer could not be recorded.".to_string(),
            QaError::DeadlineExceeded(_) => "The question took too long to answer.".to_string(),
            QaError::Cancelled => "The request was cancelled.".to_string(),
            QaError::Overloaded(_) => "Too many questions are in flight; try again shortly.".to_string(),
            QaError::InvalidRequest(msg) => format!("Invalid request: {}", msg),
            _ => "An internal error occurred.".to_string(),
        }
    }

    pub fn to_failure(&self) -> FailureResponse {
        FailureResponse {
            error_kind: self.kind(),
            message: self.public_message(),
            retryable: self.retryable(),
        }
    }
}

/// Failure body returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureResponse {
    pub error_kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_failure_is_sanitized() {
        let err = QaError::Execution(ExecutionFailure::Backend);
        let failure = err.to_failure();
        assert_eq!(failure.error_kind, ErrorKind::ExecutionError);
        assert!(!failure.retryable);
        assert!(!failure.message.to_lowercase().contains("syntax"));
    }

    #[test]
    fn test_rejection_maps_to_safety_refusal() {
        let err = QaError::ValidationRejected(RejectionReason::MultipleStatements);
        let failure = err.to_failure();
        assert_eq!(failure.error_kind, ErrorKind::ValidationRejected);
        assert!(failure.message.contains("cannot be answered safely"));
        assert!(!failure.retryable);
    }

    #[test]
    fn test_timeouts_are_retryable() {
        assert!(QaError::Execution(ExecutionFailure::Timeout).retryable());
        assert!(QaError::DeadlineExceeded(30_000).retryable());
        assert!(!QaError::Cancelled.retryable());
    }
}
