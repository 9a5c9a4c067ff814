//! SQLite history store
//!
//! Local, file-backed variant of the history log for single-node deployments
//! and the CLI. Same append-only layout as the PostgreSQL store.

use crate::db::query_history::{fold_feedback, Feedback, HistoryRecord, HistoryStore};
use crate::error::{QaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

pub struct SqliteHistoryStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    /// Open or create the history database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| QaError::Database(format!("Failed to open database: {}", e)))?;
        let store = Self {
            db: Arc::new(Mutex::new(db)),
        };
        store.init_schema()?;
        info!("Opened history database at {}", path.display());
        Ok(store)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| QaError::Database(format!("Failed to open database: {}", e)))?;
        let store = Self {
            db: Arc::new(Mutex::new(db)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let db = lock(&self.db)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS qa_history (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                final_query TEXT NOT NULL,
                result_summary TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                question_embedding TEXT,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS qa_feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL REFERENCES qa_history(id),
                helpful INTEGER NOT NULL,
                comment TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_qa_history_seq ON qa_history(seq DESC);
            CREATE INDEX IF NOT EXISTS idx_qa_feedback_record ON qa_feedback(record_id);
            "#,
        )
        .map_err(|e| QaError::Database(format!("Failed to create tables: {}", e)))?;
        Ok(())
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&db)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| QaError::Database(format!("History task failed: {}", e)))?
    }
}

fn lock(db: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|_| QaError::Database("History database lock poisoned".to_string()))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QaError::Database(format!("Bad timestamp {}: {}", raw, e)))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| QaError::Database(format!("Bad record id {}: {}", raw, e)))
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<()> {
        let record = record.clone();
        self.with_db(move |db| {
            let embedding = record
                .question_embedding
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let tx = db
                .transaction()
                .map_err(|e| QaError::HistoryWrite(format!("Failed to start transaction: {}", e)))?;
            let seq: i64 = tx
                .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM qa_history", [], |row| row.get(0))
                .map_err(|e| QaError::HistoryWrite(format!("Failed to read sequence: {}", e)))?;
            tx.execute(
                r#"
                INSERT INTO qa_history
                (id, question, final_query, result_summary, row_count, question_embedding, created_at, seq)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.id.to_string(),
                    record.question,
                    record.final_query,
                    record.result_summary,
                    record.row_count as i64,
                    embedding,
                    record.created_at.to_rfc3339(),
                    seq,
                ],
            )
            .map_err(|e| QaError::HistoryWrite(format!("Failed to insert history record: {}", e)))?;
            tx.commit()
                .map_err(|e| QaError::HistoryWrite(format!("Failed to commit: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn append_feedback(&self, record_id: Uuid, feedback: &Feedback) -> Result<()> {
        let feedback = feedback.clone();
        self.with_db(move |db| {
            let exists: Option<String> = db
                .query_row(
                    "SELECT id FROM qa_history WHERE id = ?1",
                    params![record_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(QaError::HistoryWrite(format!("Unknown record {}", record_id)));
            }
            db.execute(
                "INSERT INTO qa_feedback (record_id, helpful, comment, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record_id.to_string(),
                    feedback.helpful,
                    feedback.comment,
                    feedback.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(|e| QaError::HistoryWrite(format!("Failed to insert feedback: {}", e)))?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, n: usize) -> Result<Vec<HistoryRecord>> {
        self.with_db(move |db| {
            let mut stmt = db.prepare(
                r#"
                SELECT id, question, final_query, result_summary, row_count, question_embedding, created_at
                FROM qa_history
                ORDER BY seq DESC
                LIMIT ?1
                "#,
            )?;
            let raw_rows = stmt
                .query_map(params![n as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut records = Vec::with_capacity(raw_rows.len());
            for (id, question, final_query, result_summary, row_count, embedding, created_at) in raw_rows {
                records.push(HistoryRecord {
                    id: parse_id(&id)?,
                    question,
                    final_query,
                    result_summary,
                    row_count: row_count.max(0) as u64,
                    feedback: None,
                    question_embedding: embedding
                        .map(|e| serde_json::from_str::<Vec<f32>>(&e))
                        .transpose()?,
                    created_at: parse_time(&created_at)?,
                });
            }

            let mut events = Vec::new();
            let mut stmt = db.prepare(
                "SELECT helpful, comment, recorded_at FROM qa_feedback WHERE record_id = ?1 ORDER BY id",
            )?;
            for record in &records {
                let rows = stmt
                    .query_map(params![record.id.to_string()], |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                for (helpful, comment, recorded_at) in rows {
                    events.push((
                        record.id,
                        Feedback {
                            helpful,
                            comment,
                            recorded_at: parse_time(&recorded_at)?,
                        },
                    ));
                }
            }
            fold_feedback(&mut records, &events);
            Ok(records)
        })
        .await
    }
}
