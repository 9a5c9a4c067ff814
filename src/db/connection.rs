//! Database connection management using sqlx

use crate::config::DatabaseConfig;
use crate::error::{QaError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub type DbPool = PgPool;

/// Initialize the connection pool. Pool size is independent of request
/// concurrency; an exhausted pool blocks callers up to `acquire_timeout_secs`.
pub async fn init_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| QaError::Config("DATABASE_URL is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        max_connections = config.pool_size,
        acquire_timeout_secs = config.acquire_timeout_secs,
        "Database pool ready"
    );
    Ok(pool)
}
