pub mod compress;
pub mod context;
pub mod query;
pub mod retriever;

pub use compress::compress;
pub use context::{ContextBuilder, ContextInputs, Section, TieredContext};
pub use query::{build_queries, RagQueries};
pub use retriever::{ScoredChunk, ScoredSummary, TemporalRetriever};
