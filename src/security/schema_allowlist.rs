//! Schema Allowlist
//!
//! The set of tables and columns generated queries may touch, supplied by a
//! schema registry (static JSON file or live `information_schema`).

use crate::error::{QaError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Plain-text description used for schema documents in the corpus.
    pub fn describe(&self) -> String {
        let mut text = format!("Table {}", self.name);
        if let Some(description) = &self.description {
            text.push_str(&format!(": {}", description));
        }
        text.push_str("\nColumns:");
        for column in &self.columns {
            text.push_str(&format!("\n- {}", column.name));
            if let Some(data_type) = &column.data_type {
                text.push_str(&format!(" ({})", data_type));
            }
            if let Some(description) = &column.description {
                text.push_str(&format!(": {}", description));
            }
        }
        text
    }
}

/// Case-insensitive table/column allowlist.
#[derive(Debug, Clone, Default)]
pub struct SchemaAllowlist {
    /// Database schema the tables live in. Qualified names must match it.
    schema: Option<String>,
    tables: BTreeMap<String, TableSchema>,
    columns: BTreeSet<String>,
}

#[derive(Deserialize)]
struct AllowlistFile {
    #[serde(default)]
    schema: Option<String>,
    tables: Vec<TableSchema>,
}

impl SchemaAllowlist {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let mut allowlist = Self::default();
        for table in tables {
            for column in &table.columns {
                allowlist.columns.insert(column.name.to_lowercase());
            }
            allowlist.tables.insert(table.name.to_lowercase(), table);
        }
        allowlist
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into().to_lowercase());
        self
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Load `{"schema"?, "tables": [{"name", "columns": [{"name"}]}]}`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QaError::Schema(format!("Failed to read allowlist {}: {}", path.display(), e))
        })?;
        let file: AllowlistFile = serde_json::from_str(&raw).map_err(|e| {
            QaError::Schema(format!("Failed to parse allowlist {}: {}", path.display(), e))
        })?;
        let allowlist = Self::new(file.tables);
        Ok(match file.schema {
            Some(schema) => allowlist.with_schema(schema),
            None => allowlist,
        })
    }

    /// Accepts bare names, or `schema.table` when the schema is the allowlisted one.
    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        let parts: Vec<String> = name
            .split('.')
            .map(|part| part.trim_matches('"').to_lowercase())
            .collect();
        match parts.as_slice() {
            [bare] => self.tables.get(bare),
            [schema, bare] if self.schema.as_deref() == Some(schema.as_str()) => self.tables.get(bare),
            _ => None,
        }
    }

    /// Column belongs to at least one allowlisted table.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(&name.to_lowercase())
    }

    pub fn table_has_column(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .map(|t| t.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
            .unwrap_or(false)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Source of the allowlist consumed by the validator.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    async fn allowlist(&self) -> Result<SchemaAllowlist>;
}

/// Fixed allowlist, typically loaded from a JSON file.
pub struct StaticSchemaRegistry {
    allowlist: SchemaAllowlist,
}

impl StaticSchemaRegistry {
    pub fn new(allowlist: SchemaAllowlist) -> Self {
        Self { allowlist }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Ok(Self::new(SchemaAllowlist::from_json_file(path)?))
    }
}

#[async_trait]
impl SchemaRegistry for StaticSchemaRegistry {
    async fn allowlist(&self) -> Result<SchemaAllowlist> {
        Ok(self.allowlist.clone())
    }
}

/// Reads the allowlist from `information_schema` for one database schema,
/// optionally restricted to tables with a given prefix.
pub struct PgSchemaRegistry {
    pool: PgPool,
    schema: String,
    table_prefix: Option<String>,
}

impl PgSchemaRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            table_prefix: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = Some(prefix.into());
        self
    }
}

#[async_trait]
impl SchemaRegistry for PgSchemaRegistry {
    async fn allowlist(&self) -> Result<SchemaAllowlist> {
        let pattern = format!("{}%", self.table_prefix.as_deref().unwrap_or(""));
        let rows = sqlx::query(
            r#"
            SELECT table_name, column_name, data_type
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name LIKE $2
            ORDER BY table_name, ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QaError::Schema(format!("Failed to read information_schema: {}", e)))?;

        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for row in rows {
            let table_name: String = row.try_get("table_name")?;
            let column_name: String = row.try_get("column_name")?;
            let data_type: Option<String> = row.try_get("data_type")?;
            tables
                .entry(table_name.clone())
                .or_insert_with(|| TableSchema {
                    name: table_name,
                    description: None,
                    columns: Vec::new(),
                })
                .columns
                .push(ColumnSchema {
                    name: column_name,
                    data_type,
                    description: None,
                });
        }

        info!(tables = tables.len(), schema = %self.schema, "Loaded schema allowlist");
        Ok(SchemaAllowlist::new(tables.into_values().collect()).with_schema(self.schema.clone()))
    }
}
