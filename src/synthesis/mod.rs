//! Response Synthesis
//!
//! Narrative (model-written, constrained) and recommendations (rule-based).

pub mod narrative;
pub mod recommendations;

pub use narrative::{deterministic_narrative, NarrativeDraft, NarrativeSource, ResponseSynthesizer};
pub use recommendations::{evaluate, Comparator, Recommendation, RecommendationRule, Severity};

/// Whole numbers without decimals, everything else to two places.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}
