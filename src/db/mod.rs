//! Database module
//!
//! PostgreSQL connectivity plus the append-only history stores that feed
//! prior-query retrieval.

pub mod connection;
pub mod query_history;
pub mod sqlite_history;

pub use connection::{init_pool, DbPool};
pub use query_history::{Feedback, HistoryRecord, HistoryStore, InMemoryHistoryStore, PgHistoryStore};
pub use sqlite_history::SqliteHistoryStore;
