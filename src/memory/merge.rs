//! Hybrid merge and dynamic relevance threshold.
//!
//! Fuses two independently-scored result sets (dense vector, lexical
//! BM25) by id into a single weighted-sum ranking, then trims the tail
//! against a confidence-tiered cutoff derived from the top score.

use std::collections::HashMap;

use crate::memory::types::{HybridResult, KeywordResult, ThresholdTiers, VectorResult};

/// Anything exposing a numeric relevance score — threshold filtering is
/// written against this rather than a concrete result type so it can run
/// over any row shape that carries a score.
pub trait Scored {
    fn score(&self) -> f64;
}

impl Scored for HybridResult {
    fn score(&self) -> f64 {
        self.score
    }
}

/// The dynamic relevance cutoff: scales with the top result's
/// confidence rather than using one fixed threshold for every query.
pub fn calculate_dynamic_threshold(top: f64) -> f64 {
    if top >= ThresholdTiers::HIGH_CUT {
        top * ThresholdTiers::HIGH_MULT
    } else if top >= ThresholdTiers::MED_CUT {
        top * ThresholdTiers::MED_MULT
    } else {
        ThresholdTiers::FLOOR
    }
}

/// Retain only results scoring at or above the dynamic threshold derived
/// from `results[0]`. Identity when `enabled` is false or `results` is
/// empty. `results` must already be sorted descending by score.
pub fn apply_dynamic_threshold<T: Scored + Clone>(results: &[T], enabled: bool) -> Vec<T> {
    if !enabled || results.is_empty() {
        return results.to_vec();
    }
    let tau = calculate_dynamic_threshold(results[0].score());
    results.iter().filter(|r| r.score() >= tau).cloned().collect()
}

struct MergedRow {
    path: String,
    start_line: u32,
    end_line: u32,
    source: String,
    snippet: String,
    vector_score: f64,
    text_score: f64,
}

pub struct MergeParams<'a> {
    pub vector: &'a [VectorResult],
    pub keyword: &'a [KeywordResult],
    pub vector_weight: f64,
    pub text_weight: f64,
    pub dynamic_threshold: bool,
}

/// Fuse vector and keyword result sets by id, score by weighted sum, sort
/// descending (stable on ties), and optionally apply the dynamic
/// threshold.
pub fn merge_hybrid_results(params: MergeParams<'_>) -> Vec<HybridResult> {
    let mut order: Vec<i64> = Vec::new();
    let mut by_id: HashMap<i64, MergedRow> = HashMap::new();

    for v in params.vector {
        order.push(v.id);
        by_id.insert(
            v.id,
            MergedRow {
                path: v.path.clone(),
                start_line: v.start_line,
                end_line: v.end_line,
                source: v.source.clone(),
                snippet: v.snippet.clone(),
                vector_score: v.score,
                text_score: 0.0,
            },
        );
    }

    for k in params.keyword {
        match by_id.get_mut(&k.id) {
            Some(row) => {
                row.text_score = k.score;
                if !k.snippet.is_empty() {
                    row.snippet = k.snippet.clone();
                }
            }
            None => {
                order.push(k.id);
                by_id.insert(
                    k.id,
                    MergedRow {
                        path: k.path.clone(),
                        start_line: k.start_line,
                        end_line: k.end_line,
                        source: k.source.clone(),
                        snippet: k.snippet.clone(),
                        vector_score: 0.0,
                        text_score: k.score,
                    },
                );
            }
        }
    }

    let mut results: Vec<HybridResult> = order
        .into_iter()
        .map(|id| {
            let row = by_id.remove(&id).expect("id was just inserted into the map");
            let score = params.vector_weight * row.vector_score + params.text_weight * row.text_score;
            HybridResult {
                path: row.path,
                start_line: row.start_line,
                end_line: row.end_line,
                source: row.source,
                snippet: row.snippet,
                score,
                vector_score: row.vector_score,
                text_score: row.text_score,
            }
        })
        .collect();

    // Stable sort: ties preserve the insertion order built above.
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    apply_dynamic_threshold(&results, params.dynamic_threshold)
}
