//! Prompt Assembly
//!
//! Deterministic, token-budget-aware packing of the question, retrieved
//! context and safety rules into a single generation prompt. `assemble` is a
//! pure function of its inputs.

use crate::schema_rag::retriever::{ContextItem, RetrievedContext};
use crate::schema_rag::vector_store::ContextCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// First line of every SQL-generation prompt.
pub const SQL_TASK_HEADER: &str = "### TASK: WRITE ONE READ-ONLY SQL QUERY";

/// Safety rule embedded in every prompt regardless of configuration.
pub const CORE_SAFETY_RULE: &str = "Read-only access only; cite context ids for factual claims.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Upper bound on the estimated prompt size.
    pub token_budget: usize,
    /// Categories in packing order; later categories lose items first.
    pub category_priority: Vec<ContextCategory>,
    pub schema_max_items: usize,
    pub policy_max_items: usize,
    pub prior_query_max_items: usize,
    pub safety_instructions: Vec<String>,
    pub dialect: String,
    pub row_cap: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            token_budget: 3_000,
            category_priority: vec![
                ContextCategory::Schema,
                ContextCategory::Policy,
                ContextCategory::PriorQuery,
            ],
            schema_max_items: 5,
            policy_max_items: 2,
            prior_query_max_items: 3,
            safety_instructions: vec![
                "Generate a single SELECT statement (a WITH ... SELECT is fine). Never modify data or schema.".to_string(),
                "Use only tables and columns that appear in the schema context.".to_string(),
                "Do not invent identifiers, values or filters that the question does not ask for.".to_string(),
            ],
            dialect: "PostgreSQL".to_string(),
            row_cap: 500,
        }
    }
}

impl PromptConfig {
    pub fn max_items(&self, category: ContextCategory) -> usize {
        match category {
            ContextCategory::Schema => self.schema_max_items,
            ContextCategory::Policy => self.policy_max_items,
            ContextCategory::PriorQuery => self.prior_query_max_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub text: String,
    pub included_source_ids: Vec<String>,
    /// Context items left out by per-category limits or the token budget.
    pub dropped: usize,
    pub estimated_tokens: usize,
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn section_title(category: ContextCategory) -> &'static str {
    match category {
        ContextCategory::Schema => "SCHEMA CONTEXT",
        ContextCategory::Policy => "BUSINESS RULES AND POLICIES",
        ContextCategory::PriorQuery => "SIMILAR PAST QUESTIONS",
    }
}

fn render_item(item: &ContextItem) -> String {
    format!("[{}] {}\n", item.source_id, item.content.trim())
}

/// Assemble the SQL-generation prompt.
pub fn assemble(
    question: &str,
    context: &RetrievedContext,
    config: &PromptConfig,
    repair_note: Option<&str>,
    filters: &BTreeMap<String, String>,
) -> AssembledPrompt {
    let mut head = format!("{}\n\nYou translate questions about clinical trial supply into {} queries.\n\nRULES:\n", SQL_TASK_HEADER, config.dialect);
    head.push_str(&format!("- {}\n", CORE_SAFETY_RULE));
    for rule in &config.safety_instructions {
        head.push_str(&format!("- {}\n", rule));
    }
    head.push_str(&format!(
        "- Return at most {} rows; add a LIMIT clause.\n",
        config.row_cap
    ));

    let mut tail = String::new();
    if !filters.is_empty() {
        tail.push_str("\nFILTERS REQUESTED BY THE USER:\n");
        for (key, value) in filters {
            tail.push_str(&format!("- {} = {}\n", key, value));
        }
    }
    tail.push_str(&format!("\nQUESTION: {}\n", question.trim()));
    if let Some(note) = repair_note {
        tail.push_str(&format!(
            "\nYOUR PREVIOUS ATTEMPT WAS REJECTED: {}\n",
            note.trim()
        ));
    }
    tail.push_str("\nReturn only the SQL query, with no explanation and no markdown.\n");

    let fixed_tokens = estimate_tokens(&head) + estimate_tokens(&tail);
    let mut remaining = config.token_budget.saturating_sub(fixed_tokens);
    let mut exhausted = false;
    let mut included_source_ids = Vec::new();
    let mut dropped = 0;
    let mut body = String::new();

    for category in &config.category_priority {
        let items: Vec<&ContextItem> = context.by_category(*category).collect();
        if items.is_empty() {
            continue;
        }
        let limit = config.max_items(*category);
        let mut section = String::new();
        for (idx, item) in items.iter().enumerate() {
            if idx >= limit || exhausted {
                dropped += 1;
                continue;
            }
            let rendered = render_item(item);
            let cost = estimate_tokens(&rendered);
            if cost > remaining {
                exhausted = true;
                dropped += 1;
                continue;
            }
            remaining -= cost;
            section.push_str(&rendered);
            included_source_ids.push(item.source_id.clone());
        }
        if !section.is_empty() {
            body.push_str(&format!("\n{}:\n{}", section_title(*category), section));
        }
    }

    // Categories missing from the priority list never make it in.
    dropped += context
        .items
        .iter()
        .filter(|item| !config.category_priority.contains(&item.category))
        .count();

    if context.degraded && body.is_empty() {
        body.push_str("\nNo reference material is available; rely on well-known table names only if certain.\n");
    }

    let text = format!("{}{}{}", head, body, tail);
    let estimated_tokens = estimate_tokens(&text);
    AssembledPrompt {
        text,
        included_source_ids,
        dropped,
        estimated_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, category: ContextCategory, content: &str) -> ContextItem {
        ContextItem {
            content: content.to_string(),
            source_id: id.to_string(),
            category,
            score: 1.0,
        }
    }

    fn context() -> RetrievedContext {
        RetrievedContext {
            items: vec![
                item("schema:inventory", ContextCategory::Schema, "Table inventory: site_id, product_id, quantity_available"),
                item("policy:low_stock", ContextCategory::Policy, "Stock under 10 units is low; under 5 is critical."),
                item("history:1", ContextCategory::PriorQuery, "Previous question: which sites are low?"),
            ],
            degraded: false,
            degraded_reason: None,
        }
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let config = PromptConfig::default();
        let a = assemble("Which sites are low?", &context(), &config, None, &BTreeMap::new());
        let b = assemble("Which sites are low?", &context(), &config, None, &BTreeMap::new());
        assert_eq!(a, b);
        assert!(a.text.starts_with(SQL_TASK_HEADER));
        assert!(a.text.contains(CORE_SAFETY_RULE));
        assert_eq!(
            a.included_source_ids,
            vec!["schema:inventory", "policy:low_stock", "history:1"]
        );
        assert_eq!(a.dropped, 0);
    }

    #[test]
    fn test_budget_drops_lowest_priority_first() {
        let mut config = PromptConfig::default();
        let baseline = assemble("q", &RetrievedContext::default(), &config, None, &BTreeMap::new());
        let schema_cost = estimate_tokens(&render_item(&context().items[0]));
        let policy_cost = estimate_tokens(&render_item(&context().items[1]));
        config.token_budget = baseline.estimated_tokens + schema_cost + policy_cost + 1;

        let prompt = assemble("q", &context(), &config, None, &BTreeMap::new());
        assert!(prompt.included_source_ids.contains(&"schema:inventory".to_string()));
        assert!(prompt.included_source_ids.contains(&"policy:low_stock".to_string()));
        assert!(!prompt.included_source_ids.contains(&"history:1".to_string()));
        assert_eq!(prompt.dropped, 1);
    }

    #[test]
    fn test_fixed_parts_survive_tiny_budget() {
        let config = PromptConfig {
            token_budget: 1,
            ..PromptConfig::default()
        };
        let prompt = assemble("How many sites?", &context(), &config, Some("unknown table patients"), &BTreeMap::new());
        assert!(prompt.included_source_ids.is_empty());
        assert_eq!(prompt.dropped, 3);
        assert!(prompt.text.contains("How many sites?"));
        assert!(prompt.text.contains("unknown table patients"));
        assert!(prompt.text.contains(CORE_SAFETY_RULE));
    }

    #[test]
    fn test_per_category_limit() {
        let config = PromptConfig {
            policy_max_items: 0,
            ..PromptConfig::default()
        };
        let prompt = assemble("q", &context(), &config, None, &BTreeMap::new());
        assert!(!prompt.included_source_ids.contains(&"policy:low_stock".to_string()));
        assert_eq!(prompt.dropped, 1);
    }

    #[test]
    fn test_filters_rendered_in_key_order() {
        let filters: BTreeMap<String, String> = [
            ("study_id".to_string(), "STUDY-7".to_string()),
            ("country".to_string(), "Germany".to_string()),
        ]
        .into_iter()
        .collect();
        let prompt = assemble("q", &context(), &PromptConfig::default(), None, &filters);
        let country = prompt.text.find("country = Germany").unwrap();
        let study = prompt.text.find("study_id = STUDY-7").unwrap();
        assert!(country < study);
    }

    #[test]
    fn test_degraded_context_note() {
        let prompt = assemble(
            "q",
            &RetrievedContext::degraded("embedding unavailable"),
            &PromptConfig::default(),
            None,
            &BTreeMap::new(),
        );
        assert!(prompt.text.contains("No reference material is available"));
    }
}
