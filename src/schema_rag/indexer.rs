//! Corpus Indexer
//!
//! Builds the reference corpus the retriever searches: one schema document per
//! allowlisted table, one policy document per business rule or KPI, and one
//! prior-query document per curated example question.

use crate::error::{QaError, Result};
use crate::llm::LanguageModel;
use crate::schema_rag::vector_store::{ContextCategory, Document, InMemoryVectorStore};
use crate::security::schema_allowlist::{SchemaAllowlist, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Business rule, KPI definition or other policy text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub id: String,
    pub text: String,
}

/// Curated question with a known-good query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleQuery {
    pub id: String,
    pub question: String,
    pub sql: String,
}

/// Non-schema corpus sources, usually `config/policies.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusSources {
    #[serde(default)]
    pub policies: Vec<PolicyDocument>,
    #[serde(default)]
    pub examples: Vec<ExampleQuery>,
}

impl CorpusSources {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QaError::Config(format!("Failed to read corpus sources {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            QaError::Config(format!("Failed to parse corpus sources {}: {}", path.display(), e))
        })
    }
}

pub struct CorpusIndexer {
    model: Arc<dyn LanguageModel>,
}

impl CorpusIndexer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Embed every source document into a fresh in-memory corpus.
    pub async fn build(
        &self,
        allowlist: &SchemaAllowlist,
        sources: &CorpusSources,
    ) -> Result<InMemoryVectorStore> {
        let mut store = InMemoryVectorStore::new();

        for table in allowlist.tables() {
            let doc = self.schema_document(table).await?;
            store.add_document(doc);
        }

        for policy in &sources.policies {
            let embedding = self.model.embed(&policy.text).await?;
            store.add_document(Document {
                id: format!("policy:{}", policy.id),
                category: ContextCategory::Policy,
                text: policy.text.clone(),
                metadata: HashMap::new(),
                embedding,
            });
        }

        for example in &sources.examples {
            // prior queries are matched on the question alone
            let embedding = self.model.embed(&example.question).await?;
            let mut metadata = HashMap::new();
            metadata.insert("sql".to_string(), example.sql.clone());
            store.add_document(Document {
                id: format!("prior:{}", example.id),
                category: ContextCategory::PriorQuery,
                text: format!("Question: {}\nQuery: {}", example.question, example.sql),
                metadata,
                embedding,
            });
        }

        info!(
            documents = store.document_count(),
            tables = allowlist.table_count(),
            policies = sources.policies.len(),
            examples = sources.examples.len(),
            "Corpus built"
        );
        Ok(store)
    }

    async fn schema_document(&self, table: &TableSchema) -> Result<Document> {
        let text = table.describe();
        let embedding = self.model.embed(&text).await?;
        debug!(table = %table.name, "Embedded schema document");
        let mut metadata = HashMap::new();
        metadata.insert("table".to_string(), table.name.clone());
        metadata.insert("columns".to_string(), table.columns.len().to_string());
        Ok(Document {
            id: format!("schema:{}", table.name),
            category: ContextCategory::Schema,
            text,
            metadata,
            embedding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_rag::vector_store::VectorStore;
    use crate::security::schema_allowlist::ColumnSchema;
    use async_trait::async_trait;

    struct LengthEmbedder;

    #[async_trait]
    impl LanguageModel for LengthEmbedder {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl LanguageModel for DownEmbedder {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(String::new())
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(QaError::Llm("embedding service down".to_string()))
        }
    }

    fn allowlist() -> SchemaAllowlist {
        SchemaAllowlist::new(vec![TableSchema {
            name: "gold_inventory".to_string(),
            description: Some("Product inventory levels at clinical sites".to_string()),
            columns: vec![ColumnSchema {
                name: "quantity_available".to_string(),
                data_type: Some("INTEGER".to_string()),
                description: None,
            }],
        }])
    }

    fn sources() -> CorpusSources {
        CorpusSources {
            policies: vec![PolicyDocument {
                id: "low_stock".to_string(),
                text: "Inventory is considered LOW when quantity_available < 10".to_string(),
            }],
            examples: vec![ExampleQuery {
                id: "low_inventory".to_string(),
                question: "Which sites have low inventory?".to_string(),
                sql: "SELECT site_id FROM gold_inventory WHERE quantity_available < 10".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_build_covers_every_category() {
        let indexer = CorpusIndexer::new(Arc::new(LengthEmbedder));
        let store = indexer.build(&allowlist(), &sources()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);

        for (category, id) in [
            (ContextCategory::Schema, "schema:gold_inventory"),
            (ContextCategory::Policy, "policy:low_stock"),
            (ContextCategory::PriorQuery, "prior:low_inventory"),
        ] {
            let hits = store.query(&[1.0, 0.0], 5, category).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].document.id, id);
        }
    }

    #[tokio::test]
    async fn test_build_propagates_embedding_failure() {
        let indexer = CorpusIndexer::new(Arc::new(DownEmbedder));
        let err = indexer.build(&allowlist(), &sources()).await.unwrap_err();
        assert!(matches!(err, QaError::Llm(_)));
    }

    #[tokio::test]
    async fn test_corpus_round_trips_through_file() {
        let indexer = CorpusIndexer::new(Arc::new(LengthEmbedder));
        let store = indexer.build(&allowlist(), &sources()).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        store.save(&path).unwrap();
        let loaded = InMemoryVectorStore::load(&path).unwrap();
        assert_eq!(loaded.document_count(), 3);
    }

    #[test]
    fn test_sources_parse_with_missing_sections() {
        let sources: CorpusSources =
            serde_json::from_str(r#"{"policies": [{"id": "p", "text": "t"}]}"#).unwrap();
        assert_eq!(sources.policies.len(), 1);
        assert!(sources.examples.is_empty());
    }
}
