//! Context retrieval over the reference corpus.

pub mod indexer;
pub mod retriever;
pub mod vector_store;

pub use indexer::{CorpusIndexer, CorpusSources, ExampleQuery, PolicyDocument};
pub use retriever::{ContextItem, ContextRetriever, RetrievalConfig, Retrieval, RetrievedContext};
pub use vector_store::{ContextCategory, Document, InMemoryVectorStore, SearchResult, VectorStore};
