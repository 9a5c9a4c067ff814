pub mod bootstrap;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod generator;
pub mod grounding;
pub mod llm;
pub mod model;
pub mod prompt;
pub mod schema_rag;
pub mod security;
pub mod synthesis;
pub mod visualization;

pub use config::EngineConfig;
pub use error::{ErrorKind, FailureResponse, QaError, Result};
pub use execution_loop::{CancelHandle, QueryEngine, QueryService};
pub use model::{AnswerResponse, Confidence, QaOutcome, QaRequest};
