//! Rule-based recommendations
//!
//! Recommendations are never generated free-form: each one comes from a
//! configured threshold rule that matched at least one result row.

use crate::execution::result::{as_number, cell_text, ColumnKind, ExecutionResult, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "=",
            Comparator::Ne => "<>",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// `column comparator threshold` over every row.
///
/// `message` may use `{count}`, `{column}`, `{threshold}` and `{examples}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRule {
    pub id: String,
    pub column: String,
    pub comparator: Comparator,
    pub threshold: Value,
    pub severity: Severity,
    pub message: String,
    /// Column whose values name the matching rows; defaults to the first text column.
    #[serde(default)]
    pub label_column: Option<String>,
}

impl RecommendationRule {
    fn new(
        id: &str,
        column: &str,
        comparator: Comparator,
        threshold: Value,
        severity: Severity,
        message: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            column: column.to_string(),
            comparator,
            threshold,
            severity,
            message: message.to_string(),
            label_column: None,
        }
    }

    /// Supply-chain business rules.
    pub fn supply_defaults() -> Vec<RecommendationRule> {
        vec![
            Self::new(
                "critical_stock",
                "quantity_available",
                Comparator::Lt,
                json!(5),
                Severity::Critical,
                "{count} record(s) have critically low stock ({column} below {threshold}){examples}. Arrange an emergency resupply.",
            ),
            Self::new(
                "low_stock",
                "quantity_available",
                Comparator::Lt,
                json!(10),
                Severity::Warning,
                "{count} record(s) are low on stock ({column} below {threshold}){examples}. Schedule replenishment.",
            ),
            Self::new(
                "near_expiry",
                "days_until_expiry",
                Comparator::Lt,
                json!(90),
                Severity::Warning,
                "{count} record(s) expire within {threshold} days{examples}. Prioritise their use or plan replacement stock.",
            ),
            Self::new(
                "shipment_delay",
                "delivery_delay_days",
                Comparator::Gt,
                json!(2),
                Severity::Warning,
                "{count} shipment(s) are delayed by more than {threshold} days{examples}. Follow up with the courier.",
            ),
            Self::new(
                "high_risk",
                "risk_score",
                Comparator::Ge,
                json!(0.8),
                Severity::Critical,
                "{count} record(s) carry a critical risk score (at least {threshold}){examples}. Review mitigation plans.",
            ),
            Self::new(
                "temperature_excursion",
                "temperature_excursion_detected",
                Comparator::Eq,
                json!(true),
                Severity::Critical,
                "{count} shipment(s) recorded a temperature excursion{examples}. Quarantine affected stock pending quality review.",
            ),
            Self::new(
                "temperature_status_excursion",
                "temperature_status",
                Comparator::Eq,
                json!("excursion"),
                Severity::Critical,
                "{count} inventory record(s) are flagged with a temperature excursion{examples}. Quarantine affected stock pending quality review.",
            ),
        ]
    }

    pub fn matches(&self, row: &Row) -> bool {
        let Some(cell) = row.get(&self.column) else {
            return false;
        };
        if cell.is_null() {
            return false;
        }
        if let (Some(value), Some(threshold)) = (as_number(cell), as_number(&self.threshold)) {
            return match self.comparator {
                Comparator::Lt => value < threshold,
                Comparator::Le => value <= threshold,
                Comparator::Gt => value > threshold,
                Comparator::Ge => value >= threshold,
                Comparator::Eq => (value - threshold).abs() < 1e-9,
                Comparator::Ne => (value - threshold).abs() >= 1e-9,
            };
        }
        let equal = match (cell, &self.threshold) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (a, b) => cell_text(a).eq_ignore_ascii_case(&cell_text(b)),
        };
        match self.comparator {
            Comparator::Eq => equal,
            Comparator::Ne => !equal,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub matched_rows: usize,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity.label(), self.message)
    }
}

const MAX_EXAMPLES: usize = 3;

fn label_column<'a>(rule: &'a RecommendationRule, result: &'a ExecutionResult) -> Option<&'a str> {
    if let Some(column) = &rule.label_column {
        return result.column(column).map(|c| c.name.as_str());
    }
    result
        .columns
        .iter()
        .find(|c| c.kind == ColumnKind::Text && c.name != rule.column)
        .map(|c| c.name.as_str())
}

/// Evaluate every rule over the result; most severe first, then rule order.
pub fn evaluate(rules: &[RecommendationRule], result: &ExecutionResult) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = rules
        .iter()
        .filter_map(|rule| {
            let matching: Vec<&Row> = result.rows.iter().filter(|row| rule.matches(row)).collect();
            if matching.is_empty() {
                return None;
            }
            let examples = label_column(rule, result)
                .map(|label| {
                    let mut names: Vec<String> = matching
                        .iter()
                        .filter_map(|row| row.get(label).map(cell_text))
                        .filter(|name| !name.is_empty())
                        .collect();
                    names.dedup();
                    let more = names.len().saturating_sub(MAX_EXAMPLES);
                    names.truncate(MAX_EXAMPLES);
                    if names.is_empty() {
                        String::new()
                    } else if more > 0 {
                        format!(" ({} and {} more)", names.join(", "), more)
                    } else {
                        format!(" ({})", names.join(", "))
                    }
                })
                .unwrap_or_default();

            let message = rule
                .message
                .replace("{count}", &matching.len().to_string())
                .replace("{column}", &rule.column)
                .replace("{threshold}", &cell_text(&rule.threshold))
                .replace("{examples}", &examples);

            Some(Recommendation {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                message,
                matched_rows: matching.len(),
            })
        })
        .collect();

    // stable sort keeps configuration order within a severity
    recommendations.sort_by(|a, b| b.severity.cmp(&a.severity));
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(rows: Vec<Value>) -> ExecutionResult {
        ExecutionResult::from_rows(
            rows.into_iter().filter_map(|v| v.as_object().cloned()).collect(),
            500,
            1,
        )
    }

    #[test]
    fn test_low_and_critical_stock() {
        let result = result(vec![
            json!({"site_id": "SITE-001", "quantity_available": 3}),
            json!({"site_id": "SITE-002", "quantity_available": 8}),
            json!({"site_id": "SITE-003", "quantity_available": 40}),
        ]);
        let recs = evaluate(&RecommendationRule::supply_defaults(), &result);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].rule_id, "critical_stock");
        assert_eq!(recs[0].matched_rows, 1);
        assert!(recs[0].message.contains("SITE-001"));
        assert_eq!(recs[1].rule_id, "low_stock");
        assert_eq!(recs[1].matched_rows, 2);
        assert!(recs[0].to_string().starts_with("CRITICAL: 1 record(s)"));
    }

    #[test]
    fn test_boolean_and_text_rules() {
        let result = result(vec![
            json!({"shipment_id": "SHP-9", "temperature_excursion_detected": true, "risk_score": 0.85}),
            json!({"shipment_id": "SHP-10", "temperature_excursion_detected": false, "risk_score": 0.2}),
        ]);
        let recs = evaluate(&RecommendationRule::supply_defaults(), &result);
        let ids: Vec<_> = recs.iter().map(|r| r.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["high_risk", "temperature_excursion"]);
        assert!(recs[1].message.contains("SHP-9"));
        assert!(!recs[1].message.contains("SHP-10"));
    }

    #[test]
    fn test_no_matching_columns_no_recommendations() {
        let result = result(vec![json!({"country": "Germany", "sites": 4})]);
        assert!(evaluate(&RecommendationRule::supply_defaults(), &result).is_empty());
    }

    #[test]
    fn test_rules_deserialize_from_config() {
        let rule: RecommendationRule = serde_json::from_value(json!({
            "id": "overstock",
            "column": "quantity_on_hand",
            "comparator": "gt",
            "threshold": 1000,
            "severity": "info",
            "message": "{count} record(s) hold more than {threshold} units."
        }))
        .unwrap();
        let result = result(vec![json!({"quantity_on_hand": 1500})]);
        let recs = evaluate(&[rule], &result);
        assert_eq!(recs[0].to_string(), "INFO: 1 record(s) hold more than 1000 units.");
    }
}
