//! Query Executor
//!
//! Runs accepted queries under the row cap and an enforced timeout.

use crate::error::{ExecutionFailure, QaError, Result};
use crate::execution::result::ExecutionResult;
use crate::execution::store::RelationalStore;
use crate::security::sql_validator::AcceptedQuery;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub struct QueryExecutor {
    store: Arc<dyn RelationalStore>,
    row_cap: u64,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn RelationalStore>, row_cap: u64, timeout: Duration) -> Self {
        Self {
            store,
            row_cap,
            timeout,
        }
    }

    /// Execute an accepted query. Only sanitized `ExecutionFailure`s leave
    /// this function; backend detail is logged.
    pub async fn execute(&self, query: &AcceptedQuery) -> Result<ExecutionResult> {
        let cap = query.limit().min(self.row_cap);
        let start = Instant::now();

        let rows = match tokio::time::timeout(
            self.timeout,
            self.store.execute_read_only(query.sql(), cap, self.timeout),
        )
        .await
        {
            Ok(Ok(rows)) => rows,
            Ok(Err(QaError::Execution(failure))) => return Err(QaError::Execution(failure)),
            Ok(Err(e)) => {
                error!("Query execution failed: {}", e);
                return Err(QaError::Execution(ExecutionFailure::Backend));
            }
            Err(_) => {
                error!(timeout_ms = self.timeout.as_millis() as u64, sql = %query.sql(), "Query timed out");
                return Err(QaError::Execution(ExecutionFailure::Timeout));
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let returned = rows.len();
        let mut result = ExecutionResult::from_rows(rows, cap as usize, elapsed_ms);
        // A full page under an enforced limit may hide more rows.
        if returned as u64 == cap && (query.limit_injected() || query.limit_clamped()) {
            result.truncated = true;
        }

        info!(
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms,
            "Query executed"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::Row;
    use crate::security::schema_allowlist::{ColumnSchema, SchemaAllowlist, TableSchema};
    use crate::security::sql_validator::{SqlValidator, ValidationVerdict};
    use async_trait::async_trait;
    use serde_json::json;

    enum Behaviour {
        Rows(usize),
        Fail,
        Hang,
    }

    struct FakeStore(Behaviour);

    #[async_trait]
    impl RelationalStore for FakeStore {
        async fn execute_read_only(&self, _sql: &str, row_cap: u64, _timeout: Duration) -> Result<Vec<Row>> {
            match self.0 {
                Behaviour::Rows(n) => Ok((0..n.min(row_cap as usize + 1))
                    .filter_map(|i| json!({"site_id": format!("SITE-{:03}", i)}).as_object().cloned())
                    .collect()),
                Behaviour::Fail => Err(QaError::Database(
                    "ERROR: relation \"secret_table\" does not exist".to_string(),
                )),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn accepted(sql: &str) -> AcceptedQuery {
        let allowlist = SchemaAllowlist::new(vec![TableSchema {
            name: "sites".to_string(),
            description: None,
            columns: vec![ColumnSchema {
                name: "site_id".to_string(),
                data_type: None,
                description: None,
            }],
        }]);
        match SqlValidator::new(allowlist, 5).validate(sql) {
            ValidationVerdict::Accepted(q) => q,
            other => panic!("not accepted: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rows_bounded_by_cap() {
        let executor = QueryExecutor::new(Arc::new(FakeStore(Behaviour::Rows(50))), 5, Duration::from_secs(1));
        let result = executor.execute(&accepted("SELECT site_id FROM sites")).await.unwrap();
        assert_eq!(result.row_count, 5);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn test_small_result_not_truncated() {
        let executor = QueryExecutor::new(Arc::new(FakeStore(Behaviour::Rows(2))), 5, Duration::from_secs(1));
        let result = executor.execute(&accepted("SELECT site_id FROM sites")).await.unwrap();
        assert_eq!(result.row_count, 2);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_backend_error_is_sanitized() {
        let executor = QueryExecutor::new(Arc::new(FakeStore(Behaviour::Fail)), 5, Duration::from_secs(1));
        let err = executor.execute(&accepted("SELECT site_id FROM sites")).await.unwrap_err();
        assert!(matches!(err, QaError::Execution(ExecutionFailure::Backend)));
        assert!(!err.public_message().contains("secret_table"));
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let executor = QueryExecutor::new(Arc::new(FakeStore(Behaviour::Hang)), 5, Duration::from_millis(50));
        let err = executor.execute(&accepted("SELECT site_id FROM sites")).await.unwrap_err();
        assert!(matches!(err, QaError::Execution(ExecutionFailure::Timeout)));
    }
}
