//! Relational store
//!
//! Read-only access to the supply database.

use crate::error::{ExecutionFailure, QaError, Result};
use crate::execution::result::Row;
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, error};

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Run a read-only query, returning at most `row_cap + 1` rows so the
    /// caller can tell whether the cap cut the result short.
    async fn execute_read_only(&self, sql: &str, row_cap: u64, timeout: Duration) -> Result<Vec<Row>>;
}

/// PostgreSQL store. Each query runs in its own `READ ONLY` transaction with
/// a local `statement_timeout` and is always rolled back.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a driver error to the sanitized failure, logging the detail.
fn classify(err: sqlx::Error) -> QaError {
    let failure = match &err {
        sqlx::Error::PoolTimedOut => ExecutionFailure::PoolExhausted,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("57014") => ExecutionFailure::Timeout,
        _ => ExecutionFailure::Backend,
    };
    error!(failure = ?failure, "Query execution failed: {}", err);
    QaError::Execution(failure)
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn execute_read_only(&self, sql: &str, row_cap: u64, timeout: Duration) -> Result<Vec<Row>> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        // row_to_json keeps SELECT column order and handles every column type
        let wrapped = format!(
            "SELECT row_to_json(q)::text FROM ({}) AS q LIMIT {}",
            sql,
            row_cap.saturating_add(1)
        );
        let raw: Vec<String> = sqlx::query_scalar(&wrapped)
            .fetch_all(&mut *tx)
            .await
            .map_err(classify)?;

        tx.rollback().await.map_err(classify)?;

        let mut rows = Vec::with_capacity(raw.len());
        for text in raw {
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(serde_json::Value::Object(row)) => rows.push(row),
                Ok(other) => {
                    error!("Unexpected row shape from row_to_json: {}", other);
                    return Err(QaError::Execution(ExecutionFailure::Backend));
                }
                Err(e) => {
                    error!("Failed to decode row: {}", e);
                    return Err(QaError::Execution(ExecutionFailure::Backend));
                }
            }
        }
        debug!(rows = rows.len(), "Read-only query complete");
        Ok(rows)
    }
}
