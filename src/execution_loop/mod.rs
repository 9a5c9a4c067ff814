//! Execution Loop
//!
//! Bounded, budgeted pipeline from question to grounded answer, plus the
//! concurrent service wrapper.

pub mod budget;
pub mod error_classifier;
pub mod pipeline;
pub mod service;

pub use budget::AttemptBudget;
pub use error_classifier::{ErrorClassifier, FailureClass};
pub use pipeline::{QueryEngine, CANNOT_VERIFY_SUMMARY};
pub use service::{CancelHandle, QueryService};
