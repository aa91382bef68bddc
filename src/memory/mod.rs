//! Hybrid memory retrieval engine: lexical query building, dense/lexical
//! search primitives, and weighted-sum fusion with a dynamic threshold.

pub mod fts;
pub mod merge;
pub mod search;
pub mod types;

pub use merge::{apply_dynamic_threshold, calculate_dynamic_threshold, merge_hybrid_results, MergeParams, Scored};
pub use search::{calculate_recency_penalty, search_keyword, search_vector, ChunkStore, ChunkRow, KeywordSearchParams, SqliteChunkStore, StoreError, VectorSearchParams};
pub use types::{Chunk, HybridResult, KeywordResult, ThresholdTiers, VectorResult};
