//! Vector Store Abstraction
//!
//! Category-partitioned similarity search over the reference corpus (schema
//! descriptions, prior questions, policy text). The corpus is produced by an
//! external indexing pipeline; this side only reads it.

use crate::error::{QaError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// Corpus partition a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextCategory {
    Schema,
    PriorQuery,
    Policy,
}

impl ContextCategory {
    pub const ALL: [ContextCategory; 3] = [
        ContextCategory::Schema,
        ContextCategory::PriorQuery,
        ContextCategory::Policy,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ContextCategory::Schema => "schema",
            ContextCategory::PriorQuery => "prior_query",
            ContextCategory::Policy => "policy",
        }
    }
}

impl fmt::Display for ContextCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Document in the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub category: ContextCategory,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub embedding: Embedding,
}

/// Search result from vector store
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub document: Document,
    pub score: f32,
}

/// Similarity search over an externally maintained corpus.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Top `k` documents of `category` ranked by similarity to `vector`.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        category: ContextCategory,
    ) -> Result<Vec<SearchResult>>;

    /// Number of indexed documents.
    async fn count(&self) -> Result<usize>;
}

#[derive(Serialize, Deserialize)]
struct CorpusFile {
    dimension: usize,
    documents: Vec<Document>,
}

/// In-memory vector store with exact cosine search, one partition per category.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    partitions: HashMap<ContextCategory, Vec<Document>>,
    /// Current dimension of embeddings (0 until the first document lands)
    dimension: usize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document to the store. Documents whose dimension disagrees with
    /// the store are skipped.
    pub fn add_document(&mut self, document: Document) {
        if document.embedding.is_empty() {
            warn!("Skipping document {} without embedding", document.id);
            return;
        }
        if self.dimension == 0 {
            self.dimension = document.embedding.len();
        } else if document.embedding.len() != self.dimension {
            warn!(
                "Skipping document {}: embedding dimension {} doesn't match store dimension {}",
                document.id,
                document.embedding.len(),
                self.dimension
            );
            return;
        }
        self.partitions
            .entry(document.category)
            .or_default()
            .push(document);
    }

    /// Add multiple documents efficiently
    pub fn add_documents(&mut self, documents: Vec<Document>) {
        for doc in documents {
            self.add_document(doc);
        }
    }

    pub fn document_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Exact search within one category. Ties are broken by document id so
    /// identical inputs always rank identically.
    pub fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        category: ContextCategory,
    ) -> Result<Vec<SearchResult>> {
        let Some(documents) = self.partitions.get(&category) else {
            return Ok(Vec::new());
        };

        if query_embedding.len() != self.dimension {
            return Err(QaError::RetrievalUnavailable(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query_embedding.len(),
                self.dimension
            )));
        }

        let mut results: Vec<SearchResult> = documents
            .iter()
            .map(|doc| SearchResult {
                score: cosine_similarity(query_embedding, &doc.embedding),
                document: doc.clone(),
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        results.truncate(top_k);

        Ok(results)
    }

    /// Save the corpus to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut documents: Vec<Document> = self.partitions.values().flatten().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        let file = CorpusFile {
            dimension: self.dimension,
            documents,
        };
        let encoded = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    /// Load a corpus written by the indexing pipeline
    pub fn load(path: &Path) -> Result<Self> {
        let encoded = std::fs::read_to_string(path).map_err(|e| {
            QaError::RetrievalUnavailable(format!("Failed to read corpus {}: {}", path.display(), e))
        })?;
        let file: CorpusFile = serde_json::from_str(&encoded).map_err(|e| {
            QaError::RetrievalUnavailable(format!("Failed to parse corpus {}: {}", path.display(), e))
        })?;

        let mut store = Self {
            partitions: HashMap::new(),
            dimension: file.dimension,
        };
        store.add_documents(file.documents);
        Ok(store)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        category: ContextCategory,
    ) -> Result<Vec<SearchResult>> {
        self.search(vector, k, category)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.document_count())
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
