//! Execution Module
//!
//! Read-only query execution against the relational store.

pub mod executor;
pub mod result;
pub mod store;

pub use executor::QueryExecutor;
pub use result::{ColumnKind, ColumnMeta, ColumnStats, ExecutionResult, Row};
pub use store::{PgStore, RelationalStore};
