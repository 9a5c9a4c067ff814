//! Context Retriever
//!
//! Embeds the question once and runs an independent similarity search per
//! context category. Prior-query matches come from both the corpus and the
//! history store. Any failure degrades to an empty context instead of failing
//! the request.

use crate::db::query_history::HistoryStore;
use crate::error::{QaError, Result};
use crate::llm::LanguageModel;
use crate::schema_rag::vector_store::{cosine_similarity, ContextCategory, VectorStore};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub schema_k: usize,
    pub prior_query_k: usize,
    pub policy_k: usize,
    /// Matches scoring below this are discarded.
    pub min_score: f32,
    /// How many recent history records are scored for prior-query matches.
    pub history_window: usize,
    /// Per external call (embed, corpus lookup, history read).
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            schema_k: 5,
            prior_query_k: 3,
            policy_k: 2,
            min_score: 0.0,
            history_window: 50,
            timeout_ms: 3_000,
        }
    }
}

impl RetrievalConfig {
    pub fn k_for(&self, category: ContextCategory) -> usize {
        match category {
            ContextCategory::Schema => self.schema_k,
            ContextCategory::PriorQuery => self.prior_query_k,
            ContextCategory::Policy => self.policy_k,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One ranked piece of reference material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    pub source_id: String,
    pub category: ContextCategory,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub items: Vec<ContextItem>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl RetrievedContext {
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            degraded: true,
            degraded_reason: Some(reason.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_source(&self, source_id: &str) -> bool {
        self.items.iter().any(|item| item.source_id == source_id)
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.source_id.clone()).collect()
    }

    pub fn by_category(&self, category: ContextCategory) -> impl Iterator<Item = &ContextItem> {
        self.items.iter().filter(move |item| item.category == category)
    }
}

/// Retrieval output: the context plus the question embedding, which the
/// pipeline stores with the history record.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub context: RetrievedContext,
    pub question_embedding: Option<Vec<f32>>,
}

pub struct ContextRetriever {
    model: Arc<dyn LanguageModel>,
    store: Option<Arc<dyn VectorStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(model: Arc<dyn LanguageModel>, config: RetrievalConfig) -> Self {
        Self {
            model,
            store: None,
            history: None,
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve context for a question. Never fails: problems are reported
    /// through the `degraded` flag.
    pub async fn retrieve(&self, question: &str) -> Retrieval {
        let embedding = match tokio::time::timeout(self.config.timeout(), self.model.embed(question)).await {
            Ok(Ok(embedding)) if !embedding.is_empty() => embedding,
            Ok(Ok(_)) => {
                warn!("Embedding service returned an empty vector; continuing without context");
                return Retrieval {
                    context: RetrievedContext::degraded("empty question embedding"),
                    question_embedding: None,
                };
            }
            Ok(Err(e)) => {
                warn!("Question embedding failed, continuing without context: {}", e);
                return Retrieval {
                    context: RetrievedContext::degraded("embedding unavailable"),
                    question_embedding: None,
                };
            }
            Err(_) => {
                warn!("Question embedding timed out, continuing without context");
                return Retrieval {
                    context: RetrievedContext::degraded("embedding timed out"),
                    question_embedding: None,
                };
            }
        };

        let context = match self.search_all(&embedding).await {
            Ok(items) if items.is_empty() => {
                info!("No reference material matched; continuing in degraded mode");
                RetrievedContext {
                    items,
                    degraded: true,
                    degraded_reason: Some("no reference material available".to_string()),
                }
            }
            Ok(items) => {
                debug!(items = items.len(), "Context retrieved");
                RetrievedContext {
                    items,
                    degraded: false,
                    degraded_reason: None,
                }
            }
            Err(e) => {
                warn!("Context retrieval failed, continuing without context: {}", e);
                RetrievedContext::degraded("reference corpus unavailable")
            }
        };

        Retrieval {
            context,
            question_embedding: Some(embedding),
        }
    }

    async fn search_all(&self, embedding: &[f32]) -> Result<Vec<ContextItem>> {
        let mut items = Vec::new();
        for category in ContextCategory::ALL {
            let k = self.config.k_for(category);
            if k == 0 {
                continue;
            }
            let mut matches = self.search_corpus(embedding, k, category).await?;
            if category == ContextCategory::PriorQuery {
                matches.extend(self.search_history(embedding).await?);
            }
            matches.retain(|item| item.score >= self.config.min_score);
            rank(&mut matches);
            matches.dedup_by(|a, b| a.source_id == b.source_id);
            matches.truncate(k);
            items.extend(matches);
        }
        Ok(items)
    }

    async fn search_corpus(
        &self,
        embedding: &[f32],
        k: usize,
        category: ContextCategory,
    ) -> Result<Vec<ContextItem>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let results = tokio::time::timeout(self.config.timeout(), store.query(embedding, k, category))
            .await
            .map_err(|_| {
                QaError::RetrievalUnavailable(format!("{} lookup timed out", category))
            })??;

        Ok(results
            .into_iter()
            .map(|result| ContextItem {
                content: result.document.text,
                source_id: result.document.id,
                category,
                score: result.score,
            })
            .collect())
    }

    async fn search_history(&self, embedding: &[f32]) -> Result<Vec<ContextItem>> {
        let Some(history) = &self.history else {
            return Ok(Vec::new());
        };
        let records = tokio::time::timeout(self.config.timeout(), history.recent(self.config.history_window))
            .await
            .map_err(|_| QaError::RetrievalUnavailable("history read timed out".to_string()))??;

        Ok(records
            .iter()
            .filter_map(|record| {
                let stored = record.question_embedding.as_ref()?;
                Some(ContextItem {
                    content: record.as_context(),
                    source_id: format!("history:{}", record.id),
                    category: ContextCategory::PriorQuery,
                    score: cosine_similarity(embedding, stored),
                })
            })
            .collect())
    }
}

/// Score descending, then source id ascending.
fn rank(items: &mut [ContextItem]) {
    items.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.source_id.cmp(&b.source_id))
    });
}
