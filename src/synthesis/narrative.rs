//! Response Synthesizer
//!
//! Asks the model for a constrained JSON narrative over the result sample and
//! retrieved context. Falls back to a deterministic, data-derived narrative
//! when the model is unavailable or returns something unusable.

use crate::execution::result::{cell_text, ExecutionResult};
use crate::llm::{strip_code_fences, LanguageModel};
use crate::schema_rag::retriever::RetrievedContext;
use crate::synthesis::format_number;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// First line of every synthesis prompt.
pub const SYNTHESIS_TASK_HEADER: &str = "### TASK: SUMMARIZE QUERY RESULTS";

const MAX_CONTEXT_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeSource {
    Model,
    Deterministic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeDraft {
    pub summary: String,
    pub insights: Vec<String>,
    pub citations: Vec<String>,
    pub source: NarrativeSource,
}

#[derive(Deserialize)]
struct ModelNarrative {
    summary: String,
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    citations: Vec<String>,
}

pub struct ResponseSynthesizer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    sample_rows: usize,
}

impl ResponseSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            sample_rows: 20,
        }
    }

    pub fn with_sample_rows(mut self, sample_rows: usize) -> Self {
        self.sample_rows = sample_rows;
        self
    }

    /// Produce a narrative. `correction` lists claims a previous draft could
    /// not support.
    pub async fn synthesize(
        &self,
        question: &str,
        result: &ExecutionResult,
        context: &RetrievedContext,
        correction: Option<&str>,
    ) -> NarrativeDraft {
        let prompt = self.build_prompt(question, result, context, correction);
        let raw = match tokio::time::timeout(self.timeout, self.model.generate(&prompt)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("Narrative generation failed, using data-derived summary: {}", e);
                return deterministic_narrative(result);
            }
            Err(_) => {
                warn!("Narrative generation timed out, using data-derived summary");
                return deterministic_narrative(result);
            }
        };

        match serde_json::from_str::<ModelNarrative>(strip_code_fences(&raw)) {
            Ok(parsed) if !parsed.summary.trim().is_empty() => {
                let citations: Vec<String> = parsed
                    .citations
                    .into_iter()
                    .filter(|id| {
                        let known = context.contains_source(id);
                        if !known {
                            debug!(citation = %id, "Dropping citation not present in retrieved context");
                        }
                        known
                    })
                    .collect();
                NarrativeDraft {
                    summary: parsed.summary.trim().to_string(),
                    insights: parsed
                        .insights
                        .into_iter()
                        .map(|i| i.trim().to_string())
                        .filter(|i| !i.is_empty())
                        .collect(),
                    citations,
                    source: NarrativeSource::Model,
                }
            }
            Ok(_) => {
                warn!("Model returned an empty summary, using data-derived summary");
                deterministic_narrative(result)
            }
            Err(e) => {
                warn!("Unparseable narrative from model, using data-derived summary: {}", e);
                deterministic_narrative(result)
            }
        }
    }

    pub fn build_prompt(
        &self,
        question: &str,
        result: &ExecutionResult,
        context: &RetrievedContext,
        correction: Option<&str>,
    ) -> String {
        let mut prompt = format!(
            "{}\n\nYou explain query results for a clinical trial supply team.\n\
             Use ONLY the numbers, names and facts in the result data and reference material below.\n\
             Do not estimate, extrapolate or add outside knowledge. Cite reference ids you rely on.\n\n\
             QUESTION: {}\n",
            SYNTHESIS_TASK_HEADER,
            question.trim()
        );

        let columns: Vec<String> = result
            .columns
            .iter()
            .map(|c| format!("{} ({:?})", c.name, c.kind).to_lowercase())
            .collect();
        prompt.push_str(&format!(
            "\nRESULT: {} row(s){}; columns: {}\n",
            result.row_count,
            if result.truncated { ", capped" } else { "" },
            if columns.is_empty() { "none".to_string() } else { columns.join(", ") }
        ));

        if !result.rows.is_empty() {
            prompt.push_str("\nSAMPLE ROWS:\n");
            for row in result.rows.iter().take(self.sample_rows) {
                let cells: Vec<String> = row
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, cell_text(v)))
                    .collect();
                prompt.push_str(&format!("- {}\n", cells.join(", ")));
            }
        }

        let stats = result.column_stats();
        if !stats.is_empty() {
            prompt.push_str("\nAGGREGATES:\n");
            for s in &stats {
                prompt.push_str(&format!(
                    "- {}: sum={}, min={}, max={}, avg={}\n",
                    s.column,
                    format_number(s.sum),
                    format_number(s.min),
                    format_number(s.max),
                    format_number(s.avg)
                ));
            }
        }

        if !context.items.is_empty() {
            prompt.push_str("\nREFERENCE MATERIAL:\n");
            for item in &context.items {
                let content: String = item.content.chars().take(MAX_CONTEXT_CHARS).collect();
                prompt.push_str(&format!("[{}] {}\n", item.source_id, content.replace('\n', " ")));
            }
        }

        if let Some(note) = correction {
            prompt.push_str(&format!(
                "\nYOUR PREVIOUS SUMMARY MADE CLAIMS THE DATA DOES NOT SUPPORT: {}\nDo not repeat them.\n",
                note
            ));
        }

        prompt.push_str(
            "\nRespond with JSON only: {\"summary\": \"2-3 sentences\", \"insights\": [\"...\"], \"citations\": [\"reference id\"]}\n",
        );
        prompt
    }
}

/// Narrative built only from the result itself.
pub fn deterministic_narrative(result: &ExecutionResult) -> NarrativeDraft {
    let mut insights = Vec::new();
    let summary = if result.rows.is_empty() {
        "No records matched the question.".to_string()
    } else if result.row_count == 1 && result.columns.len() == 1 {
        let column = &result.columns[0].name;
        let value = result.rows[0].get(column).map(cell_text).unwrap_or_default();
        format!("The result for {} is {}.", column, value)
    } else {
        for s in result.column_stats() {
            insights.push(format!(
                "{} ranges from {} to {} with a total of {}.",
                s.column,
                format_number(s.min),
                format_number(s.max),
                format_number(s.sum)
            ));
        }
        format!(
            "The query returned {} row(s) covering {}.",
            result.row_count,
            result.column_names().join(", ")
        )
    };

    let summary = if result.truncated {
        format!("{} Only the first {} rows are shown.", summary, result.row_count)
    } else {
        summary
    };

    NarrativeDraft {
        summary,
        insights,
        citations: Vec::new(),
        source: NarrativeSource::Deterministic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{QaError, Result};
    use crate::schema_rag::retriever::ContextItem;
    use crate::schema_rag::vector_store::ContextCategory;
    use async_trait::async_trait;
    use serde_json::json;

    struct Canned(std::result::Result<&'static str, ()>);

    #[async_trait]
    impl LanguageModel for Canned {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            self.0
                .map(|s| s.to_string())
                .map_err(|_| QaError::Llm("down".to_string()))
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    fn result() -> ExecutionResult {
        ExecutionResult::from_rows(
            vec![
                json!({"site_id": "SITE-001", "quantity_available": 3}),
                json!({"site_id": "SITE-002", "quantity_available": 7}),
            ]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
            500,
            4,
        )
    }

    fn context() -> RetrievedContext {
        RetrievedContext {
            items: vec![ContextItem {
                content: "Inventory is LOW when quantity_available < 10".to_string(),
                source_id: "policy:low_stock".to_string(),
                category: ContextCategory::Policy,
                score: 0.9,
            }],
            degraded: false,
            degraded_reason: None,
        }
    }

    #[tokio::test]
    async fn test_model_json_parsed_and_unknown_citations_dropped() {
        let synthesizer = ResponseSynthesizer::new(
            Arc::new(Canned(Ok(r#"```json
{"summary": "Two sites are below 10 units.", "insights": ["SITE-001 has 3 units."], "citations": ["policy:low_stock", "policy:made_up"]}
```"#))),
            Duration::from_secs(1),
        );
        let draft = synthesizer.synthesize("low sites?", &result(), &context(), None).await;
        assert_eq!(draft.source, NarrativeSource::Model);
        assert_eq!(draft.citations, vec!["policy:low_stock"]);
        assert_eq!(draft.insights.len(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_falls_back() {
        let synthesizer = ResponseSynthesizer::new(Arc::new(Canned(Err(()))), Duration::from_secs(1));
        let draft = synthesizer.synthesize("low sites?", &result(), &context(), None).await;
        assert_eq!(draft.source, NarrativeSource::Deterministic);
        assert!(draft.summary.contains("2 row(s)"));
    }

    #[tokio::test]
    async fn test_garbage_output_falls_back() {
        let synthesizer = ResponseSynthesizer::new(Arc::new(Canned(Ok("Sure! Here you go."))), Duration::from_secs(1));
        let draft = synthesizer.synthesize("q", &result(), &context(), None).await;
        assert_eq!(draft.source, NarrativeSource::Deterministic);
    }

    #[test]
    fn test_prompt_contains_only_result_material() {
        let synthesizer = ResponseSynthesizer::new(Arc::new(Canned(Err(()))), Duration::from_secs(1))
            .with_sample_rows(1);
        let prompt = synthesizer.build_prompt("low sites?", &result(), &context(), Some("5 units"));
        assert!(prompt.starts_with(SYNTHESIS_TASK_HEADER));
        assert!(prompt.contains("site_id=SITE-001"));
        assert!(!prompt.contains("SITE-002"));
        assert!(prompt.contains("quantity_available: sum=10, min=3, max=7, avg=5"));
        assert!(prompt.contains("[policy:low_stock]"));
        assert!(prompt.contains("Do not repeat them"));
    }

    #[test]
    fn test_deterministic_narratives() {
        let empty = ExecutionResult::from_rows(Vec::new(), 500, 1);
        assert_eq!(deterministic_narrative(&empty).summary, "No records matched the question.");

        let scalar = ExecutionResult::from_rows(
            json!({"total": 42}).as_object().cloned().into_iter().collect(),
            500,
            1,
        );
        assert_eq!(deterministic_narrative(&scalar).summary, "The result for total is 42.");

        let draft = deterministic_narrative(&result());
        assert_eq!(
            draft.insights,
            vec!["quantity_available ranges from 3 to 7 with a total of 10."]
        );
    }
}
