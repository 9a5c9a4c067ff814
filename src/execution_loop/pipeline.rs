//! Query Pipeline
//!
//! The bounded state machine behind every question:
//!
//! retrieve -> assemble -> generate -> validate (reject: regenerate) ->
//! execute -> synthesize -> ground (reject: regenerate) -> visualize ->
//! respond + history.
//!
//! Query generation and narrative regeneration draw from one shared
//! `AttemptBudget`. Nothing reaches the executor without an `AcceptedQuery`.

use crate::config::EngineConfig;
use crate::db::query_history::{HistoryRecord, HistoryStore};
use crate::error::{QaError, Result};
use crate::execution::executor::QueryExecutor;
use crate::execution::result::ExecutionResult;
use crate::execution::store::RelationalStore;
use crate::execution_loop::budget::AttemptBudget;
use crate::execution_loop::error_classifier::{ErrorClassifier, FailureClass};
use crate::generator::QueryGenerator;
use crate::grounding::GroundingChecker;
use crate::llm::LanguageModel;
use crate::model::{AnswerResponse, Confidence, Question};
use crate::prompt::{assemble, PromptConfig};
use crate::schema_rag::retriever::{ContextRetriever, RetrievedContext};
use crate::schema_rag::vector_store::VectorStore;
use crate::security::schema_allowlist::SchemaAllowlist;
use crate::security::sql_validator::{AcceptedQuery, SqlValidator, ValidationVerdict};
use crate::synthesis::narrative::{NarrativeSource, ResponseSynthesizer};
use crate::synthesis::recommendations::{evaluate, RecommendationRule};
use crate::visualization;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Summary used when no verifiable sentence survives grounding.
pub const CANNOT_VERIFY_SUMMARY: &str =
    "This question cannot be answered verifiably from the available data.";

/// Narrative that survived grounding.
#[derive(Debug)]
struct GroundedNarrative {
    summary: String,
    insights: Vec<String>,
    citations: Vec<String>,
    confidence: Confidence,
    grounded: bool,
}

pub struct QueryEngine {
    retriever: ContextRetriever,
    prompt_config: PromptConfig,
    generator: QueryGenerator,
    validator: SqlValidator,
    executor: QueryExecutor,
    synthesizer: ResponseSynthesizer,
    grounding: GroundingChecker,
    classifier: ErrorClassifier,
    rules: Vec<RecommendationRule>,
    history: Option<Arc<dyn HistoryStore>>,
    max_attempts: u32,
    history_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        config: &EngineConfig,
        model: Arc<dyn LanguageModel>,
        allowlist: SchemaAllowlist,
        store: Arc<dyn RelationalStore>,
    ) -> Self {
        let limits = &config.limits;
        let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
        let mut prompt_config = config.prompt.clone();
        prompt_config.row_cap = limits.row_cap;

        Self {
            retriever: ContextRetriever::new(Arc::clone(&model), config.retrieval.clone()),
            prompt_config,
            generator: QueryGenerator::new(Arc::clone(&model), llm_timeout),
            validator: SqlValidator::new(allowlist, limits.row_cap)
                .with_extra_functions(&config.extra_sql_functions),
            executor: QueryExecutor::new(store, limits.row_cap, limits.query_timeout()),
            synthesizer: ResponseSynthesizer::new(model, llm_timeout),
            grounding: GroundingChecker::new(),
            classifier: ErrorClassifier::new(),
            rules: config.recommendation_rules.clone(),
            history: None,
            max_attempts: limits.max_attempts,
            history_timeout: limits.history_timeout(),
        }
    }

    /// Attach the reference corpus.
    pub fn with_corpus(mut self, corpus: Arc<dyn VectorStore>) -> Self {
        self.retriever = self.retriever.with_store(corpus);
        self
    }

    /// Attach the history store: read for prior queries, appended after
    /// grounded answers.
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.retriever = self.retriever.with_history(Arc::clone(&history));
        self.history = Some(history);
        self
    }

    pub fn validator(&self) -> &SqlValidator {
        &self.validator
    }

    pub fn history(&self) -> Option<&Arc<dyn HistoryStore>> {
        self.history.as_ref()
    }

    /// Run the whole pipeline for one question.
    pub async fn answer(&self, question: &Question) -> Result<AnswerResponse> {
        let started = Instant::now();
        let mut budget = AttemptBudget::new(self.max_attempts);
        info!(question = %question.text, filters = question.filters.len(), "Answering question");

        let retrieval = self.retriever.retrieve(&question.text).await;
        let context = &retrieval.context;
        if context.degraded {
            warn!(
                reason = context.degraded_reason.as_deref().unwrap_or("unknown"),
                "Answering without reference material"
            );
        }

        let accepted = self.accepted_query(question, context, &mut budget).await?;
        let result = self.executor.execute(&accepted).await?;

        let narrative = self
            .grounded_narrative(question, &accepted, &result, context, &mut budget)
            .await;

        let visualization = visualization::select(&result);
        let recommendations: Vec<String> = evaluate(&self.rules, &result)
            .iter()
            .map(|r| r.to_string())
            .collect();

        let history_id = if narrative.grounded {
            self.record_history(
                question,
                &accepted,
                &narrative.summary,
                &result,
                retrieval.question_embedding.clone(),
            )
            .await
        } else {
            debug!("Answer not fully grounded; skipping history");
            None
        };

        let confidence = if context.degraded && narrative.confidence == Confidence::High {
            Confidence::Medium
        } else {
            narrative.confidence
        };

        info!(
            attempts = budget.used(),
            rows = result.row_count,
            confidence = ?confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Question answered"
        );

        Ok(AnswerResponse {
            query: accepted.sql().to_string(),
            tables: accepted.tables().to_vec(),
            data: result.rows.clone(),
            summary: narrative.summary,
            insights: narrative.insights,
            recommendations,
            visualization,
            citations: narrative.citations,
            confidence,
            grounded: narrative.grounded,
            degraded_context: context.degraded,
            truncated: result.truncated,
            attempts: budget.used(),
            row_count: result.row_count,
            execution_time_ms: result.execution_time_ms,
            history_id,
        })
    }

    /// Generate and validate until a query is accepted or the budget runs out.
    async fn accepted_query(
        &self,
        question: &Question,
        context: &RetrievedContext,
        budget: &mut AttemptBudget,
    ) -> Result<AcceptedQuery> {
        let mut repair_note: Option<String> = None;
        let mut last_error: Option<QaError> = None;
        let mut rejected = None;

        while let Some(attempt) = budget.try_consume() {
            let prompt = assemble(
                &question.text,
                context,
                &self.prompt_config,
                repair_note.as_deref(),
                &question.filters,
            );
            debug!(
                attempt,
                tokens = prompt.estimated_tokens,
                dropped = prompt.dropped,
                "Prompt assembled"
            );

            let error = match self.generator.generate(&prompt, attempt).await {
                Ok(candidate) => match self.validator.validate(&candidate.text) {
                    ValidationVerdict::Accepted(query) => {
                        info!(attempt, tables = ?query.tables(), "Query accepted");
                        return Ok(query);
                    }
                    ValidationVerdict::Rejected { reason, stage } => {
                        warn!(attempt, stage = ?stage, reason = %reason, "Candidate query rejected");
                        QaError::ValidationRejected(reason)
                    }
                },
                Err(e) => e,
            };

            let class = self.classifier.classify(&error);
            if !class.is_retryable() {
                return Err(error);
            }
            if let FailureClass::Rejected(reason) = &class {
                rejected = Some(reason.clone());
            }
            repair_note = class.repair_note();
            last_error = Some(error);
        }

        warn!(attempts = budget.used(), "Attempt budget exhausted before a query was accepted");
        // a rejection anywhere in the run means the question gets a safety refusal
        match (rejected, last_error) {
            (Some(reason), _) => Err(QaError::ValidationRejected(reason)),
            (None, Some(error)) => Err(error),
            (None, None) => Err(QaError::Generation("no generation attempts available".to_string())),
        }
    }

    /// Synthesize, check grounding, and regenerate or strip as the budget allows.
    async fn grounded_narrative(
        &self,
        question: &Question,
        accepted: &AcceptedQuery,
        result: &ExecutionResult,
        context: &RetrievedContext,
        budget: &mut AttemptBudget,
    ) -> GroundedNarrative {
        let mut correction: Option<String> = None;
        loop {
            let draft = self
                .synthesizer
                .synthesize(&question.text, result, context, correction.as_deref())
                .await;
            let verdict = self
                .grounding
                .check(&draft, result, context, accepted.filter_numbers());
            debug!(sources = ?verdict.context_sources(), "Context supporting narrative claims");

            if verdict.passed {
                let confidence = if draft.source == NarrativeSource::Model && !result.truncated {
                    Confidence::High
                } else {
                    Confidence::Medium
                };
                return GroundedNarrative {
                    summary: draft.summary,
                    insights: draft.insights,
                    citations: draft.citations,
                    confidence,
                    grounded: true,
                };
            }

            let unsupported = verdict.unsupported_texts();
            if verdict.summary_failed() {
                let class = self
                    .classifier
                    .classify(&QaError::Grounding(unsupported.join(", ")));
                if class.is_retryable() {
                    if let Some(attempt) = budget.try_consume() {
                        warn!(attempt, class = %class, unsupported = ?unsupported, "Summary not grounded; regenerating narrative");
                        correction = class.repair_note();
                        continue;
                    }
                }
            }

            let stripped = self.grounding.strip(&draft, &verdict);
            warn!(
                unsupported = ?unsupported,
                removed_sentences = stripped.removed_sentences,
                removed_insights = stripped.removed_insights,
                "Stripped unsupported claims"
            );

            if stripped.removed_sentences == 0 {
                return GroundedNarrative {
                    summary: stripped.summary,
                    insights: stripped.insights,
                    citations: draft.citations,
                    confidence: Confidence::Medium,
                    grounded: true,
                };
            }

            let summary = if stripped.summary.trim().is_empty() {
                CANNOT_VERIFY_SUMMARY.to_string()
            } else {
                stripped.summary
            };
            return GroundedNarrative {
                summary,
                insights: stripped.insights,
                citations: draft.citations,
                confidence: Confidence::Low,
                grounded: false,
            };
        }
    }

    /// Append the interaction. Failures are logged, never surfaced.
    async fn record_history(
        &self,
        question: &Question,
        accepted: &AcceptedQuery,
        summary: &str,
        result: &ExecutionResult,
        embedding: Option<Vec<f32>>,
    ) -> Option<Uuid> {
        let history = self.history.as_ref()?;
        let record = HistoryRecord::new(
            question.text.clone(),
            accepted.sql(),
            summary,
            result.row_count as u64,
            embedding,
        );
        match tokio::time::timeout(self.history_timeout, history.append(&record)).await {
            Ok(Ok(())) => {
                debug!(id = %record.id, "History record appended");
                Some(record.id)
            }
            Ok(Err(e)) => {
                warn!("History write failed: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.history_timeout.as_millis() as u64,
                    "History write timed out"
                );
                None
            }
        }
    }
}
