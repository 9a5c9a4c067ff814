//! Error Classifier
//!
//! Classifies failures inside the query-generation loop so the pipeline knows
//! whether to spend another attempt and what to tell the model.

use crate::error::{ErrorKind, QaError};
use crate::security::sql_validator::RejectionReason;
use std::fmt;

/// Generation-loop failure taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// The model call failed or timed out; try again unchanged.
    GenerationFailed,
    /// The validator refused the candidate; try again with a repair note.
    Rejected(RejectionReason),
    /// The narrative summary made claims the data does not support; regenerate
    /// with those claims listed.
    Ungrounded(String),
    /// Anything else stops the loop.
    Fatal(ErrorKind),
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::GenerationFailed => write!(f, "GenerationFailed"),
            FailureClass::Rejected(reason) => write!(f, "Rejected({})", reason.code()),
            FailureClass::Ungrounded(_) => write!(f, "Ungrounded"),
            FailureClass::Fatal(kind) => write!(f, "Fatal({:?})", kind),
        }
    }
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Fatal(_))
    }

    /// Note prepended to the next prompt, if the failure calls for one.
    pub fn repair_note(&self) -> Option<String> {
        match self {
            FailureClass::Rejected(reason) => Some(reason.repair_hint()),
            FailureClass::Ungrounded(claims) => Some(claims.clone()),
            _ => None,
        }
    }
}

/// Error classifier
#[derive(Debug, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &QaError) -> FailureClass {
        match error {
            QaError::Llm(_) | QaError::Generation(_) => FailureClass::GenerationFailed,
            QaError::ValidationRejected(reason) => FailureClass::Rejected(reason.clone()),
            QaError::Grounding(claims) => FailureClass::Ungrounded(claims.clone()),
            other => FailureClass::Fatal(other.kind()),
        }
    }
}
