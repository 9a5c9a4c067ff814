//! Security Module
//!
//! Schema allowlist and the static SQL acceptance gate.

pub mod schema_allowlist;
pub mod sql_validator;

pub use schema_allowlist::{
    ColumnSchema, PgSchemaRegistry, SchemaAllowlist, SchemaRegistry, StaticSchemaRegistry, TableSchema,
};
pub use sql_validator::{AcceptedQuery, RejectionReason, SqlValidator, ValidationStage, ValidationVerdict};
