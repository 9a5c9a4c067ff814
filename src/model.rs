//! Request and response types exchanged with callers.

use crate::error::{FailureResponse, QaError, Result};
use crate::execution::result::Row;
use crate::visualization::VisualizationSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const MAX_QUESTION_CHARS: usize = 2_000;

/// Incoming request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaRequest {
    pub question: String,
    /// Opaque requester identity, passed through for auditing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_context: Option<Value>,
    /// Optional filter hints such as `{"study_id": "STUDY-001"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
}

impl QaRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            requester_context: None,
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Validate and stamp the request.
    pub fn into_question(self) -> Result<Question> {
        let text = self.question.trim().to_string();
        if text.is_empty() {
            return Err(QaError::InvalidRequest("question is empty".to_string()));
        }
        if text.chars().count() > MAX_QUESTION_CHARS {
            return Err(QaError::InvalidRequest(format!(
                "question exceeds {} characters",
                MAX_QUESTION_CHARS
            )));
        }
        let filters = self
            .filters
            .into_iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        Ok(Question {
            text,
            asked_at: Utc::now(),
            requester: self.requester_context,
            filters,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    pub text: String,
    pub asked_at: DateTime<Utc>,
    pub requester: Option<Value>,
    pub filters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Successful answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub query: String,
    pub data: Vec<Row>,
    pub summary: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub visualization: VisualizationSpec,
    pub citations: Vec<String>,
    pub tables: Vec<String>,
    pub confidence: Confidence,
    /// The summary passed grounding without any sentence being removed.
    pub grounded: bool,
    pub degraded_context: bool,
    pub truncated: bool,
    pub attempts: u32,
    pub row_count: usize,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_id: Option<Uuid>,
}

/// Either an answer or a sanitized failure; this is what goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QaOutcome {
    Answer(Box<AnswerResponse>),
    Failure(FailureResponse),
}

impl QaOutcome {
    pub fn is_answer(&self) -> bool {
        matches!(self, QaOutcome::Answer(_))
    }
}

impl From<Result<AnswerResponse>> for QaOutcome {
    fn from(result: Result<AnswerResponse>) -> Self {
        match result {
            Ok(answer) => QaOutcome::Answer(Box::new(answer)),
            Err(e) => QaOutcome::Failure(e.to_failure()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_defaults_optional_fields() {
        let request: QaRequest = serde_json::from_str(r#"{"question": "How many sites?"}"#).unwrap();
        assert!(request.filters.is_empty());
        assert!(request.requester_context.is_none());
    }

    #[test]
    fn test_into_question_trims_and_validates() {
        let question = QaRequest::new("  Which sites are low?  ")
            .with_filter("study_id", " STUDY-001 ")
            .with_filter("region", " ")
            .into_question()
            .unwrap();
        assert_eq!(question.text, "Which sites are low?");
        assert_eq!(question.filters.len(), 1);
        assert_eq!(question.filters["study_id"], "STUDY-001");

        let err = QaRequest::new("   ").into_question().unwrap_err();
        assert!(matches!(err, QaError::InvalidRequest(_)));

        let long = "a".repeat(MAX_QUESTION_CHARS + 1);
        assert!(QaRequest::new(long).into_question().is_err());
    }

    #[test]
    fn test_failure_outcome_serializes_flat() {
        let outcome: QaOutcome = Err(QaError::Cancelled).into();
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["error_kind"], "cancelled");
        assert_eq!(value["retryable"], false);
        match outcome {
            QaOutcome::Failure(f) => assert_eq!(f.error_kind, ErrorKind::Cancelled),
            QaOutcome::Answer(_) => panic!("expected failure"),
        }
    }
}
