//! Visualization Selector
//!
//! Pure mapping from the shape of a result to a chart hint for the dashboard.

use crate::execution::result::{ColumnKind, ExecutionResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Table,
    Text,
    Bar,
    Line,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationSpec {
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    pub x_axis: Option<String>,
    pub y_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl VisualizationSpec {
    fn plain(chart_type: ChartType) -> Self {
        Self {
            chart_type,
            x_axis: None,
            y_axis: None,
            title: None,
        }
    }

    fn chart(chart_type: ChartType, x: &str, y: &str) -> Self {
        Self {
            chart_type,
            x_axis: Some(x.to_string()),
            y_axis: Some(y.to_string()),
            title: Some(format!("{} by {}", y.replace('_', " "), x.replace('_', " "))),
        }
    }
}

/// Choose a visualization for a result.
///
/// Empty results and wide results are tables; a single value is text; a
/// category/time column paired with a numeric column is a bar or line chart.
pub fn select(result: &ExecutionResult) -> VisualizationSpec {
    if result.is_empty() {
        return VisualizationSpec::plain(ChartType::Table);
    }
    if result.row_count == 1 && result.columns.len() == 1 {
        return VisualizationSpec::plain(ChartType::Text);
    }
    if let [first, second] = result.columns.as_slice() {
        let pair = if second.kind == ColumnKind::Numeric {
            Some((first, second))
        } else if first.kind == ColumnKind::Numeric {
            Some((second, first))
        } else {
            None
        };
        if let Some((axis, value)) = pair {
            if axis.kind == ColumnKind::Temporal {
                return VisualizationSpec::chart(ChartType::Line, &axis.name, &value.name);
            }
            if axis.kind.is_categorical() {
                return VisualizationSpec::chart(ChartType::Bar, &axis.name, &value.name);
            }
        }
    }
    VisualizationSpec::plain(ChartType::Table)
}
