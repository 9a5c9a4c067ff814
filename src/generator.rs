//! Query Generator
//!
//! One language-model call per attempt. The output is untrusted text; it is
//! only ever handed to the validator.

use crate::error::{QaError, Result};
use crate::llm::{strip_code_fences, LanguageModel};
use crate::prompt::AssembledPrompt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub text: String,
    /// 1-based attempt index within the request budget.
    pub attempt: u32,
}

pub struct QueryGenerator {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
}

impl QueryGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    pub async fn generate(&self, prompt: &AssembledPrompt, attempt: u32) -> Result<CandidateQuery> {
        let raw = match tokio::time::timeout(self.timeout, self.model.generate(&prompt.text)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(attempt, "Query generation failed: {}", e);
                return Err(QaError::Generation(e.to_string()));
            }
            Err(_) => {
                warn!(attempt, "Query generation timed out");
                return Err(QaError::Generation(format!(
                    "model did not answer within {} ms",
                    self.timeout.as_millis()
                )));
            }
        };

        let text = extract_sql(&raw);
        debug!(attempt, sql = %text, "Candidate query generated");
        Ok(CandidateQuery { text, attempt })
    }
}

/// Pull the SQL out of a model answer: raw SQL, fenced SQL, or a JSON object
/// with a `sql_query`/`sql` field.
pub fn extract_sql(raw: &str) -> String {
    let body = strip_code_fences(raw);
    if body.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for key in ["sql_query", "sql", "query"] {
                if let Some(sql) = value.get(key).and_then(|v| v.as_str()) {
                    return strip_code_fences(sql).to_string();
                }
            }
            return String::new();
        }
    }
    body.to_string()
}
