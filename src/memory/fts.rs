//! FTS query builder and BM25 score normalizer.
//!
//! Extracts word runs from a raw query and joins them with `AND` so every
//! extracted term must match, rather than any.

use std::sync::OnceLock;

use regex::Regex;

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+").expect("word pattern is a valid regex"))
}

/// Tokenize `raw` into `[A-Za-z0-9_]+` runs, double-quote each (stripping
/// any embedded quotes so a malicious query can't break out of the quoted
/// term), and AND them together for an FTS5 `MATCH` expression. `None` if
/// the query has no such runs.
pub fn build_fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = word_pattern()
        .find_iter(raw)
        .map(|m| m.as_str().replace('"', ""))
        .filter(|t| !t.is_empty())
        .collect();

    if terms.is_empty() {
        return None;
    }

    Some(
        terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" AND "),
    )
}

/// Convert a raw BM25 rank into a bounded `(0, 1]` relevance score. Lower
/// (more negative, per SQLite FTS5 convention) ranks are better matches,
/// so the rank is clamped at 0 before inverting. A non-finite rank is
/// treated as the worst possible match (999).
pub fn bm25_rank_to_score(rank: f64) -> f64 {
    let rank = if rank.is_finite() { rank } else { 999.0 };
    1.0 / (1.0 + rank.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_quotes_terms() {
        assert_eq!(
            build_fts_query("fix the auth bug"),
            Some("\"fix\" AND \"the\" AND \"auth\" AND \"bug\"".to_string())
        );
    }

    #[test]
    fn strips_embedded_quotes() {
        let query = build_fts_query("what\"s this").unwrap();
        assert!(!query.contains("what\"s"));
    }

    #[test]
    fn no_word_runs_returns_none() {
        assert_eq!(build_fts_query("???!!!"), None);
        assert_eq!(build_fts_query(""), None);
    }

    #[test]
    fn bm25_zero_rank_is_one() {
        assert_eq!(bm25_rank_to_score(0.0), 1.0);
    }

    #[test]
    fn bm25_negative_rank_clamped_to_zero() {
        assert_eq!(bm25_rank_to_score(-5.0), 1.0);
    }

    #[test]
    fn bm25_positive_rank_below_one() {
        let score = bm25_rank_to_score(3.0);
        assert!(score > 0.0 && score < 1.0);
        assert!((score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn bm25_non_finite_rank_treated_as_worst() {
        let nan_score = bm25_rank_to_score(f64::NAN);
        let expected = 1.0 / (1.0 + 999.0);
        assert!((nan_score - expected).abs() < 1e-9);
    }
}
