//! Wiring shared by the CLI and the HTTP server: turns an `EngineConfig`
//! into a ready `QueryService`.

use crate::config::EngineConfig;
use crate::db::connection::init_pool;
use crate::db::query_history::{HistoryStore, InMemoryHistoryStore, PgHistoryStore};
use crate::db::sqlite_history::SqliteHistoryStore;
use crate::error::{QaError, Result};
use crate::execution::store::PgStore;
use crate::execution_loop::pipeline::QueryEngine;
use crate::execution_loop::service::QueryService;
use crate::llm::{LanguageModel, LlmClient};
use crate::schema_rag::vector_store::{InMemoryVectorStore, VectorStore};
use crate::security::schema_allowlist::{
    PgSchemaRegistry, SchemaAllowlist, SchemaRegistry, StaticSchemaRegistry,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

/// Allowlist from the configured JSON file, else from the live database.
pub async fn load_allowlist(config: &EngineConfig, pool: Option<&PgPool>) -> Result<SchemaAllowlist> {
    let registry: Box<dyn SchemaRegistry> = match (&config.sources.schema_allowlist_path, pool) {
        (Some(path), _) => Box::new(StaticSchemaRegistry::from_json_file(path)?),
        (None, Some(pool)) => {
            let mut registry = PgSchemaRegistry::new(pool.clone());
            if let Some(prefix) = &config.sources.schema_table_prefix {
                registry = registry.with_table_prefix(prefix.clone());
            }
            Box::new(registry)
        }
        (None, None) => {
            return Err(QaError::Config(
                "No schema allowlist file and no database to read one from".to_string(),
            ))
        }
    };
    let allowlist = registry.allowlist().await?;
    if allowlist.is_empty() {
        return Err(QaError::Schema("Schema allowlist is empty".to_string()));
    }
    info!(tables = allowlist.table_count(), "Schema allowlist loaded");
    Ok(allowlist)
}

/// SQLite file if configured, else Postgres, else process memory.
pub async fn open_history(config: &EngineConfig, pool: Option<&PgPool>) -> Result<Arc<dyn HistoryStore>> {
    if let Some(path) = &config.sources.history_db_path {
        info!(path = %path.display(), "Using SQLite history store");
        return Ok(Arc::new(SqliteHistoryStore::open(path)?));
    }
    if let Some(pool) = pool {
        let store = PgHistoryStore::new(pool.clone());
        store.ensure_schema().await?;
        info!("Using PostgreSQL history store");
        return Ok(Arc::new(store));
    }
    warn!("No history database configured; history is kept in memory only");
    Ok(Arc::new(InMemoryHistoryStore::new()))
}

/// The corpus is optional: without it the engine runs in degraded mode.
pub fn load_corpus(config: &EngineConfig) -> Option<Arc<dyn VectorStore>> {
    let path = config.sources.corpus_path.as_ref()?;
    match InMemoryVectorStore::load(path) {
        Ok(store) => {
            info!(documents = store.document_count(), "Reference corpus loaded");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!("Reference corpus unavailable, continuing without it: {}", e);
            None
        }
    }
}

pub fn language_model(config: &EngineConfig) -> Result<Arc<dyn LanguageModel>> {
    Ok(Arc::new(LlmClient::from_config(&config.llm)?))
}

/// Build the full service from configuration.
pub async fn build_service(config: &EngineConfig) -> Result<QueryService> {
    info!(config = ?config.redacted(), "Starting query engine");
    let pool = init_pool(&config.database).await?;
    let allowlist = load_allowlist(config, Some(&pool)).await?;
    let history = open_history(config, Some(&pool)).await?;
    let model = language_model(config)?;

    let mut engine = QueryEngine::new(config, model, allowlist, Arc::new(PgStore::new(pool)))
        .with_history(history);
    if let Some(corpus) = load_corpus(config) {
        engine = engine.with_corpus(corpus);
    }

    Ok(QueryService::new(
        engine,
        config.limits.max_concurrent_requests,
        config.limits.deadline(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_allowlist_requires_a_source() {
        let config = EngineConfig::default();
        let err = load_allowlist(&config, None).await.unwrap_err();
        assert!(matches!(err, QaError::Config(_)));
    }

    #[tokio::test]
    async fn test_allowlist_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tables": [{{"name": "gold_inventory", "columns": [{{"name": "quantity_available"}}]}}]}}"#
        )
        .unwrap();
        let mut config = EngineConfig::default();
        config.sources.schema_allowlist_path = Some(file.path().to_path_buf());
        let allowlist = load_allowlist(&config, None).await.unwrap();
        assert!(allowlist.has_table("gold_inventory"));
    }

    #[tokio::test]
    async fn test_history_falls_back_to_memory() {
        let config = EngineConfig::default();
        let history = open_history(&config, None).await.unwrap();
        assert!(history.recent(5).await.unwrap().is_empty());
    }

    #[test]
    fn test_missing_corpus_is_not_fatal() {
        let mut config = EngineConfig::default();
        config.sources.corpus_path = Some("/nonexistent/corpus.json".into());
        assert!(load_corpus(&config).is_none());
    }
}
