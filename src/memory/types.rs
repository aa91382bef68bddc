//! Shared data model for the hybrid retrieval engine: chunks and the
//! scored projections over them that flow through search and merge.

use serde::{Deserialize, Serialize};

/// A small passage of indexed text with stable identity, embedding, and
/// provenance. Corpus record for both the dense and lexical search paths.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: i64,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub source: String,
    pub text: String,
    pub embedding: Vec<f32>,
    /// Wall-clock milliseconds, or `None` if the chunk carries no
    /// freshness signal.
    pub updated_at: Option<i64>,
    pub model: String,
}

/// A scored row from the dense-vector search primitive. Keeps `id` so the
/// hybrid merge can join it against keyword rows — dropped again once a
/// `HybridResult` is produced.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorResult {
    pub id: i64,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub source: String,
    pub snippet: String,
    pub score: f64,
    pub updated_at: Option<i64>,
}

/// A scored row from the lexical (BM25) search primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordResult {
    pub id: i64,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub source: String,
    pub snippet: String,
    /// Normalized BM25 score, via `bm25_rank_to_score`.
    pub score: f64,
    pub updated_at: Option<i64>,
}

/// A fused, ranked result as handed back to retrieval callers. Drops
/// `id`, `embedding`, and `updated_at` — none of those survive past
/// ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub source: String,
    pub snippet: String,
    pub score: f64,
    pub vector_score: f64,
    pub text_score: f64,
}

/// The dynamic-threshold tiers, as constants rather than a runtime
/// config — these are fixed literal cutoffs, not tunable knobs.
pub struct ThresholdTiers;

impl ThresholdTiers {
    pub const HIGH_CUT: f64 = 0.7;
    pub const MED_CUT: f64 = 0.3;
    pub const HIGH_MULT: f64 = 0.5;
    pub const MED_MULT: f64 = 0.6;
    pub const FLOOR: f64 = 0.15;
}
