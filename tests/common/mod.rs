//! Deterministic collaborators for pipeline tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supply_qa::config::EngineConfig;
use supply_qa::db::query_history::InMemoryHistoryStore;
use supply_qa::error::{QaError, Result};
use supply_qa::execution::{RelationalStore, Row};
use supply_qa::execution_loop::{QueryEngine, QueryService};
use supply_qa::llm::LanguageModel;
use supply_qa::prompt::SQL_TASK_HEADER;
use supply_qa::schema_rag::indexer::{CorpusIndexer, CorpusSources, ExampleQuery, PolicyDocument};
use supply_qa::schema_rag::vector_store::VectorStore;
use supply_qa::security::schema_allowlist::{ColumnSchema, SchemaAllowlist, TableSchema};
use supply_qa::synthesis::narrative::SYNTHESIS_TASK_HEADER;

pub const EMBEDDING_DIM: usize = 16;

/// Bag-of-words hashing embedding; identical text gives identical vectors.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; EMBEDDING_DIM];
    vector[0] = 1.0;
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hash: u32 = 2_166_136_261;
        for byte in word.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(16_777_619);
        }
        vector[1 + (hash as usize % (EMBEDDING_DIM - 1))] += 1.0;
    }
    vector
}

/// Language model that replays scripted answers. SQL prompts and narrative
/// prompts have separate scripts; the last entry repeats once a script runs out.
#[derive(Default)]
pub struct ScriptedModel {
    sql: Vec<String>,
    narratives: Vec<String>,
    fail_generation: bool,
    fail_embeddings: bool,
    delay: Option<Duration>,
    pub sql_calls: AtomicUsize,
    pub narrative_calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sql(mut self, responses: &[&str]) -> Self {
        self.sql = responses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_narratives(mut self, responses: &[Value]) -> Self {
        self.narratives = responses.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn failing_generation(mut self) -> Self {
        self.fail_generation = true;
        self
    }

    pub fn failing_embeddings(mut self) -> Self {
        self.fail_embeddings = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn sql_calls(&self) -> usize {
        self.sql_calls.load(Ordering::SeqCst)
    }

    pub fn narrative_calls(&self) -> usize {
        self.narrative_calls.load(Ordering::SeqCst)
    }

    pub fn sql_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with(SQL_TASK_HEADER))
            .cloned()
            .collect()
    }

    fn pick(script: &[String], call: usize) -> Option<String> {
        script.get(call.min(script.len().saturating_sub(1))).cloned()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if prompt.starts_with(SQL_TASK_HEADER) {
            let call = self.sql_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_generation {
                return Err(QaError::Llm("model service unavailable".to_string()));
            }
            Self::pick(&self.sql, call).ok_or_else(|| QaError::Llm("no SQL scripted".to_string()))
        } else if prompt.starts_with(SYNTHESIS_TASK_HEADER) {
            let call = self.narrative_calls.fetch_add(1, Ordering::SeqCst);
            Self::pick(&self.narratives, call)
                .ok_or_else(|| QaError::Llm("no narrative scripted".to_string()))
        } else {
            Err(QaError::Llm("unexpected prompt".to_string()))
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail_embeddings {
            return Err(QaError::Llm("embedding service unavailable".to_string()));
        }
        Ok(hash_embedding(text))
    }
}

/// Relational store serving fixed rows.
pub struct MockStore {
    rows: Vec<Row>,
    fail: bool,
    pub calls: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn with_rows(rows: Vec<Value>) -> Self {
        Self {
            rows: rows.into_iter().filter_map(|v| v.as_object().cloned()).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_rows(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelationalStore for MockStore {
    async fn execute_read_only(&self, sql: &str, row_cap: u64, _timeout: Duration) -> Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(sql.to_string());
        if self.fail {
            return Err(QaError::Database(
                "ERROR: syntax error at or near \"FROM\" in relation gold_inventory (password=hunter2)"
                    .to_string(),
            ));
        }
        Ok(self.rows.iter().take(row_cap as usize + 1).cloned().collect())
    }
}

fn column(name: &str, data_type: &str) -> ColumnSchema {
    ColumnSchema {
        name: name.to_string(),
        data_type: Some(data_type.to_string()),
        description: None,
    }
}

pub fn allowlist() -> SchemaAllowlist {
    SchemaAllowlist::new(vec![
        TableSchema {
            name: "gold_inventory".to_string(),
            description: Some("Product inventory levels at clinical sites".to_string()),
            columns: vec![
                column("inventory_id", "VARCHAR"),
                column("site_id", "VARCHAR"),
                column("site_name", "VARCHAR"),
                column("product_id", "VARCHAR"),
                column("quantity_available", "INTEGER"),
                column("days_until_expiry", "INTEGER"),
            ],
        },
        TableSchema {
            name: "gold_clinical_sites".to_string(),
            description: Some("Clinical trial sites".to_string()),
            columns: vec![
                column("site_id", "VARCHAR"),
                column("site_name", "VARCHAR"),
                column("country", "VARCHAR"),
            ],
        },
    ])
}

/// Policies deliberately free of the number five.
pub fn corpus_sources() -> CorpusSources {
    CorpusSources {
        policies: vec![
            PolicyDocument {
                id: "low_stock".to_string(),
                text: "Inventory is considered LOW when quantity_available < 10".to_string(),
            },
            PolicyDocument {
                id: "near_expiry".to_string(),
                text: "Products are near expiry when days_until_expiry < 90".to_string(),
            },
        ],
        examples: vec![ExampleQuery {
            id: "sites_by_country".to_string(),
            question: "How many sites are there per country?".to_string(),
            sql: "SELECT country, COUNT(*) AS sites FROM gold_clinical_sites GROUP BY country".to_string(),
        }],
    }
}

pub async fn corpus(model: Arc<ScriptedModel>) -> Arc<dyn VectorStore> {
    let store = CorpusIndexer::new(model)
        .build(&allowlist(), &corpus_sources())
        .await
        .unwrap();
    Arc::new(store)
}

pub fn low_stock_rows() -> Vec<Value> {
    vec![
        json!({"site_id": "SITE-001", "site_name": "Berlin Charite Clinic", "quantity_available": 3}),
        json!({"site_id": "SITE-002", "site_name": "Lyon Research Center", "quantity_available": 8}),
    ]
}

pub const LOW_STOCK_SQL: &str =
    "SELECT site_id, site_name, quantity_available FROM gold_inventory WHERE quantity_available < 10";

pub struct Harness {
    pub model: Arc<ScriptedModel>,
    pub store: Arc<MockStore>,
    pub history: Arc<InMemoryHistoryStore>,
    pub service: Arc<QueryService>,
}

pub async fn harness(model: ScriptedModel, store: MockStore) -> Harness {
    harness_with(model, store, EngineConfig::default(), true).await
}

pub async fn harness_with(
    model: ScriptedModel,
    store: MockStore,
    mut config: EngineConfig,
    with_corpus: bool,
) -> Harness {
    config.llm.timeout_secs = 5;
    let model = Arc::new(model);
    let store = Arc::new(store);
    let history = Arc::new(InMemoryHistoryStore::new());

    let mut engine = QueryEngine::new(&config, model.clone(), allowlist(), store.clone())
        .with_history(history.clone());
    if with_corpus {
        engine = engine.with_corpus(corpus(model.clone()).await);
    }
    let service = QueryService::new(
        engine,
        config.limits.max_concurrent_requests,
        config.limits.deadline(),
    );

    Harness {
        model,
        store,
        history,
        service: Arc::new(service),
    }
}
