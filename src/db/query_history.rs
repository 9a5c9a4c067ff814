//! Query history repository
//!
//! Append-only log of answered questions. Records are never updated in place;
//! feedback arrives as separate events and is folded into the record on read.

use crate::error::{QaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One accepted, grounded interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub question: String,
    pub final_query: String,
    pub result_summary: String,
    pub row_count: u64,
    #[serde(default)]
    pub feedback: Option<Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn new(
        question: impl Into<String>,
        final_query: impl Into<String>,
        result_summary: impl Into<String>,
        row_count: u64,
        question_embedding: Option<Vec<f32>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            final_query: final_query.into(),
            result_summary: result_summary.into(),
            row_count,
            feedback: None,
            question_embedding,
            created_at: Utc::now(),
        }
    }

    /// Text used when the record is offered back as prior-query context.
    pub fn as_context(&self) -> String {
        let mut text = format!(
            "Previous question: {}\nSQL used: {}\nAnswer: {}",
            self.question, self.final_query, self.result_summary
        );
        if let Some(feedback) = &self.feedback {
            text.push_str(if feedback.helpful {
                "\nUser feedback: helpful"
            } else {
                "\nUser feedback: not helpful"
            });
        }
        text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub helpful: bool,
    #[serde(default)]
    pub comment: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl Feedback {
    pub fn new(helpful: bool, comment: Option<String>) -> Self {
        Self {
            helpful,
            comment,
            recorded_at: Utc::now(),
        }
    }
}

/// History persistence.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record. An id that already exists is an error.
    async fn append(&self, record: &HistoryRecord) -> Result<()>;

    /// Append a feedback event for an existing record.
    async fn append_feedback(&self, record_id: Uuid, feedback: &Feedback) -> Result<()>;

    /// Most recent `n` records, newest first, with their latest feedback.
    async fn recent(&self, n: usize) -> Result<Vec<HistoryRecord>>;
}

/// Attach the latest feedback event per record.
pub(crate) fn fold_feedback(records: &mut [HistoryRecord], events: &[(Uuid, Feedback)]) {
    let mut latest: HashMap<Uuid, &Feedback> = HashMap::new();
    for (id, feedback) in events {
        match latest.get(id) {
            Some(existing) if existing.recorded_at > feedback.recorded_at => {}
            _ => {
                latest.insert(*id, feedback);
            }
        }
    }
    for record in records.iter_mut() {
        if let Some(feedback) = latest.get(&record.id) {
            record.feedback = Some((*feedback).clone());
        }
    }
}

/// Process-local history, used by tests and the CLI when no database is configured.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<Vec<HistoryRecord>>,
    feedback: RwLock<Vec<(Uuid, Feedback)>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(QaError::HistoryWrite(format!(
                "Record {} already exists",
                record.id
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn append_feedback(&self, record_id: Uuid, feedback: &Feedback) -> Result<()> {
        if !self.records.read().await.iter().any(|r| r.id == record_id) {
            return Err(QaError::HistoryWrite(format!("Unknown record {}", record_id)));
        }
        self.feedback.write().await.push((record_id, feedback.clone()));
        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Vec<HistoryRecord>> {
        let mut recent: Vec<HistoryRecord> = {
            let records = self.records.read().await;
            records.iter().rev().take(n).cloned().collect()
        };
        let events = self.feedback.read().await;
        fold_feedback(&mut recent, &events);
        Ok(recent)
    }
}

/// PostgreSQL-backed history (`qa_history` + `qa_feedback`).
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the history tables when missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS qa_history (
                id UUID PRIMARY KEY,
                question TEXT NOT NULL,
                final_query TEXT NOT NULL,
                result_summary TEXT NOT NULL,
                row_count BIGINT NOT NULL,
                question_embedding TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS qa_feedback (
                id BIGSERIAL PRIMARY KEY,
                record_id UUID NOT NULL REFERENCES qa_history(id),
                helpful BOOLEAN NOT NULL,
                comment TEXT,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_qa_history_created_at ON qa_history(created_at DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, record: &HistoryRecord) -> Result<()> {
        let embedding = record
            .question_embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO qa_history
                (id, question, final_query, result_summary, row_count, question_embedding, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(&record.question)
        .bind(&record.final_query)
        .bind(&record.result_summary)
        .bind(record.row_count as i64)
        .bind(embedding)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QaError::HistoryWrite(format!("Failed to insert history record: {}", e)))?;

        Ok(())
    }

    async fn append_feedback(&self, record_id: Uuid, feedback: &Feedback) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO qa_feedback (record_id, helpful, comment, recorded_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record_id)
        .bind(feedback.helpful)
        .bind(&feedback.comment)
        .bind(feedback.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| QaError::HistoryWrite(format!("Failed to insert feedback: {}", e)))?;

        Ok(())
    }

    async fn recent(&self, n: usize) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, question, final_query, result_summary, row_count, question_embedding, created_at
            FROM qa_history
            ORDER BY created_at DESC, id
            LIMIT $1
            "#,
        )
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding: Option<String> = row.try_get("question_embedding")?;
            let row_count: i64 = row.try_get("row_count")?;
            records.push(HistoryRecord {
                id: row.try_get("id")?,
                question: row.try_get("question")?,
                final_query: row.try_get("final_query")?,
                result_summary: row.try_get("result_summary")?,
                row_count: row_count.max(0) as u64,
                feedback: None,
                question_embedding: embedding
                    .map(|e| serde_json::from_str::<Vec<f32>>(&e))
                    .transpose()?,
                created_at: row.try_get("created_at")?,
            });
        }

        if records.is_empty() {
            return Ok(records);
        }

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let feedback_rows = sqlx::query(
            r#"
            SELECT record_id, helpful, comment, recorded_at
            FROM qa_feedback
            WHERE record_id = ANY($1)
            ORDER BY recorded_at
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(feedback_rows.len());
        for row in feedback_rows {
            events.push((
                row.try_get::<Uuid, _>("record_id")?,
                Feedback {
                    helpful: row.try_get("helpful")?,
                    comment: row.try_get("comment")?,
                    recorded_at: row.try_get("recorded_at")?,
                },
            ));
        }
        fold_feedback(&mut records, &events);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = InMemoryHistoryStore::new();
        for q in ["first", "second", "third"] {
            store
                .append(&HistoryRecord::new(q, "SELECT 1", "ok", 1, None))
                .await
                .unwrap();
        }
        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].question, "third");
        assert_eq!(recent[1].question, "second");
    }

    #[tokio::test]
    async fn test_duplicate_append_rejected() {
        let store = InMemoryHistoryStore::new();
        let record = HistoryRecord::new("q", "SELECT 1", "ok", 1, None);
        store.append(&record).await.unwrap();
        let err = store.append(&record).await.unwrap_err();
        assert!(matches!(err, QaError::HistoryWrite(_)));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_feedback_folds_latest_without_mutating_record() {
        let store = InMemoryHistoryStore::new();
        let record = HistoryRecord::new("q", "SELECT 1", "ok", 1, None);
        store.append(&record).await.unwrap();

        let mut early = Feedback::new(false, None);
        early.recorded_at = Utc::now() - Duration::minutes(5);
        store.append_feedback(record.id, &early).await.unwrap();
        store
            .append_feedback(record.id, &Feedback::new(true, Some("useful".to_string())))
            .await
            .unwrap();

        let recent = store.recent(1).await.unwrap();
        let feedback = recent[0].feedback.as_ref().unwrap();
        assert!(feedback.helpful);
        assert_eq!(feedback.comment.as_deref(), Some("useful"));

        assert!(store.records.read().await[0].feedback.is_none());
    }

    #[tokio::test]
    async fn test_feedback_for_unknown_record_fails() {
        let store = InMemoryHistoryStore::new();
        let err = store
            .append_feedback(Uuid::new_v4(), &Feedback::new(true, None))
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::HistoryWrite(_)));
    }

    #[test]
    fn test_as_context_mentions_query() {
        let record = HistoryRecord::new("How many sites?", "SELECT COUNT(*) FROM sites", "There are 4 sites.", 1, None);
        let text = record.as_context();
        assert!(text.contains("SELECT COUNT(*) FROM sites"));
        assert!(text.contains("How many sites?"));
    }
}
