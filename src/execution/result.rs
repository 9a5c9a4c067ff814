//! Execution Result - bounded row set returned by the executor

use crate::error::{QaError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;

/// One result row, columns in SELECT order.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Temporal,
    Boolean,
    Text,
    /// Every value was null.
    Unknown,
}

impl ColumnKind {
    /// Text-like values usable as chart categories.
    pub fn is_categorical(&self) -> bool {
        matches!(self, ColumnKind::Text | ColumnKind::Boolean)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub kind: ColumnKind,
}

/// Aggregates over one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub column: String,
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub rows: Vec<Row>,
    pub columns: Vec<ColumnMeta>,
    pub row_count: usize,
    /// The row cap cut the result short (or may have).
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    /// Build a result, keeping at most `row_cap` rows.
    pub fn from_rows(mut rows: Vec<Row>, row_cap: usize, execution_time_ms: u64) -> Self {
        let mut truncated = false;
        if rows.len() > row_cap {
            rows.truncate(row_cap);
            truncated = true;
        }
        let columns = infer_columns(&rows);
        Self {
            row_count: rows.len(),
            rows,
            columns,
            truncated,
            execution_time_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Numeric cells of a column, nulls and non-numeric values skipped.
    pub fn numeric_values(&self, column: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).and_then(as_number))
            .collect()
    }

    /// Sum/min/max/avg for every numeric column.
    pub fn column_stats(&self) -> Vec<ColumnStats> {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::Numeric)
            .filter_map(|c| {
                let values = self.numeric_values(&c.name);
                if values.is_empty() {
                    return None;
                }
                let sum: f64 = values.iter().sum();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                Some(ColumnStats {
                    column: c.name.clone(),
                    count: values.len(),
                    sum,
                    min,
                    max,
                    avg: sum / values.len() as f64,
                })
            })
            .collect()
    }

    /// Write rows as CSV with a header line.
    pub fn export_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        let names = self.column_names();
        csv_writer
            .write_record(&names)
            .map_err(|e| QaError::Io(std::io::Error::other(e)))?;
        for row in &self.rows {
            let record: Vec<String> = names
                .iter()
                .map(|name| row.get(*name).map(cell_text).unwrap_or_default())
                .collect();
            csv_writer
                .write_record(&record)
                .map_err(|e| QaError::Io(std::io::Error::other(e)))?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String> {
        let mut buffer = Vec::new();
        self.export_csv(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| QaError::Io(std::io::Error::other(e)))
    }
}

/// Numeric view of a cell. Numeric strings count (NUMERIC columns may arrive quoted).
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Display text of a cell; null renders empty.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_temporal(text: &str) -> bool {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || DateTime::parse_from_rfc3339(text).is_ok()
}

fn infer_kind<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnKind {
    let mut kind: Option<ColumnKind> = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Number(_) => ColumnKind::Numeric,
            Value::Bool(_) => ColumnKind::Boolean,
            Value::String(s) if is_temporal(s) => ColumnKind::Temporal,
            _ => ColumnKind::Text,
        };
        kind = match kind {
            None => Some(this),
            Some(k) if k == this => Some(k),
            Some(_) => Some(ColumnKind::Text),
        };
    }
    kind.unwrap_or(ColumnKind::Unknown)
}

fn infer_columns(rows: &[Row]) -> Vec<ColumnMeta> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    first
        .keys()
        .map(|name| ColumnMeta {
            name: name.clone(),
            kind: infer_kind(rows.iter().filter_map(|row| row.get(name))),
        })
        .collect()
}
