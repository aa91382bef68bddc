//! Vector and lexical search primitives, the `ChunkStore` trait boundary,
//! and a SQLite + FTS5 reference implementation.
//!
//! `rusqlite` with bundled SQLite, an FTS5 virtual table kept in sync via
//! `INSERT`/`UPDATE`/`DELETE` triggers, and the usual
//! `cosine_similarity`/`embedding_to_blob`/`blob_to_embedding` helpers for
//! the brute-force fallback path. `ChunkStore` is a trait rather than a
//! concrete type since retrieval is written against an abstract store,
//! not this SQLite adapter specifically.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use thiserror::Error;

use crate::config::RecencyConfig;
use crate::memory::types::{Chunk, KeywordResult, VectorResult};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("chunk store error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A chunk row as returned by the store, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: i64,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
    pub source: String,
    pub updated_at: Option<i64>,
    /// Populated only when the caller needs it for brute-force cosine
    /// scoring (`all_candidates`); empty for FTS rows.
    pub embedding: Vec<f32>,
}

/// The chunk/FTS store boundary the search primitives call through — any
/// SQL-shaped collaborator conforming to this trait will do.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Whether an accelerated vector index exists for vectors of this
    /// dimensionality. Side-effect profile is implementation-defined —
    /// callers must not assume it's pure.
    async fn ensure_vector_ready(&self, dim: usize) -> bool;

    /// Top-`limit` chunks by cosine distance, restricted to `model` and
    /// (optionally) `source`, via an accelerated index. Only called when
    /// `ensure_vector_ready` returned true.
    async fn query_vector_topk(
        &self,
        model: &str,
        source: Option<&str>,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(ChunkRow, f64)>, StoreError>;

    /// Every chunk matching `model`/`source`, with embeddings populated,
    /// for the brute-force cosine fallback.
    async fn all_candidates(&self, model: &str, source: Option<&str>) -> Result<Vec<ChunkRow>, StoreError>;

    /// FTS5 `MATCH` query restricted to `model`/`source`, ordered by
    /// `bm25()` ascending, each row paired with its raw rank.
    async fn fts_search(
        &self,
        model: &str,
        source: Option<&str>,
        fts_query: &str,
        limit: usize,
    ) -> Result<Vec<(ChunkRow, f64)>, StoreError>;
}

// ---------------------------------------------------------------------------
// Recency penalty
// ---------------------------------------------------------------------------

const MS_PER_DAY: f64 = 86_400_000.0;

/// Recency penalty: zero for future/unknown timestamps, otherwise
/// growing linearly from 0 to `lambda` as age grows from 0 to
/// `window_days`, capped at `lambda` beyond that.
pub fn calculate_recency_penalty(updated_at: Option<i64>, now: i64, lambda: f64, window_days: u32) -> f64 {
    let Some(updated_at) = updated_at else {
        return 0.0;
    };
    if updated_at > now {
        return 0.0;
    }
    let window_ms = window_days as f64 * MS_PER_DAY;
    if window_ms <= 0.0 {
        return lambda;
    }
    let age_ms = (now - updated_at) as f64;
    let ratio = (age_ms / window_ms).min(1.0);
    lambda * ratio
}

/// Cosine similarity between two equal-length (or zero-padded) vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

/// Truncate `text` to at most `max_chars` UTF-16 code units without
/// splitting a surrogate pair.
pub fn truncate_snippet(text: &str, max_chars: usize) -> String {
    let mut units = 0usize;
    for (byte_idx, ch) in text.char_indices() {
        let width = ch.len_utf16();
        if units + width > max_chars {
            return text[..byte_idx].to_string();
        }
        units += width;
    }
    text.to_string()
}

// ---------------------------------------------------------------------------
// Dense-vector search
// ---------------------------------------------------------------------------

pub struct VectorSearchParams<'a> {
    pub query_vec: &'a [f32],
    pub limit: usize,
    pub model: &'a str,
    pub source: Option<&'a str>,
    pub recency: Option<&'a RecencyConfig>,
    /// Current wall-clock milliseconds, supplied by the caller rather
    /// than read from the system clock here.
    pub now: i64,
    pub snippet_max_chars: usize,
}

/// Dense-vector search. Tries the accelerated index first; falls back to
/// a brute-force cosine scan over every candidate chunk.
pub async fn search_vector(store: &dyn ChunkStore, params: VectorSearchParams<'_>) -> Result<Vec<VectorResult>, StoreError> {
    if params.limit == 0 || params.query_vec.is_empty() {
        return Ok(Vec::new());
    }

    let mut rows: Vec<(ChunkRow, f64)> = if store.ensure_vector_ready(params.query_vec.len()).await {
        store
            .query_vector_topk(params.model, params.source, params.query_vec, params.limit)
            .await?
            .into_iter()
            .map(|(row, dist)| (row, 1.0 - dist))
            .collect()
    } else {
        let candidates = store.all_candidates(params.model, params.source).await?;
        let mut scored: Vec<(ChunkRow, f64)> = candidates
            .into_iter()
            .map(|row| {
                let score = cosine_similarity(params.query_vec, &row.embedding);
                (row, score)
            })
            .filter(|(_, score)| score.is_finite())
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(params.limit);
        scored
    };

    if let Some(recency) = params.recency {
        if recency.enabled {
            for (row, score) in rows.iter_mut() {
                let penalty = calculate_recency_penalty(row.updated_at, params.now, recency.lambda, recency.window_days);
                *score = (*score - penalty).max(0.0);
            }
            rows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        }
    }

    Ok(rows
        .into_iter()
        .map(|(row, score)| VectorResult {
            id: row.id,
            path: row.path,
            start_line: row.start_line,
            end_line: row.end_line,
            source: row.source,
            snippet: truncate_snippet(&row.text, params.snippet_max_chars),
            score,
            updated_at: row.updated_at,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Lexical (BM25) search
// ---------------------------------------------------------------------------

pub struct KeywordSearchParams<'a> {
    pub query: &'a str,
    pub limit: usize,
    pub model: &'a str,
    pub source: Option<&'a str>,
    pub snippet_max_chars: usize,
}

/// Lexical (BM25) search.
pub async fn search_keyword(store: &dyn ChunkStore, params: KeywordSearchParams<'_>) -> Result<Vec<KeywordResult>, StoreError> {
    if params.limit == 0 {
        return Ok(Vec::new());
    }
    let Some(fts_query) = crate::memory::fts::build_fts_query(params.query) else {
        return Ok(Vec::new());
    };

    let rows = store.fts_search(params.model, params.source, &fts_query, params.limit).await?;

    Ok(rows
        .into_iter()
        .map(|(row, rank)| {
            let score = crate::memory::fts::bm25_rank_to_score(rank);
            KeywordResult {
                id: row.id,
                path: row.path,
                start_line: row.start_line,
                end_line: row.end_line,
                source: row.source,
                snippet: truncate_snippet(&row.text, params.snippet_max_chars),
                score,
                updated_at: row.updated_at,
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// SqliteChunkStore
// ---------------------------------------------------------------------------

/// SQLite + FTS5 reference implementation of `ChunkStore`.
///
/// Bundled SQLite carries no native vector index, so `ensure_vector_ready`
/// always reports `false`, which means this adapter's `query_vector_topk`
/// only exists so a future accelerated adapter has something to conform
/// to; callers always take the `all_candidates` branch against this
/// store.
pub struct SqliteChunkStore {
    conn: Mutex<Connection>,
}

impl SqliteChunkStore {
    pub fn open_path(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                path       TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line   INTEGER NOT NULL,
                text       TEXT NOT NULL,
                embedding  BLOB NOT NULL,
                source     TEXT NOT NULL,
                updated_at INTEGER,
                model      TEXT NOT NULL
            );",
        )?;

        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                path, text,
                content='chunks',
                content_rowid='id'
            );",
        )?;

        conn.execute_batch(
            "CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, path, text) VALUES (new.id, new.path, new.text);
            END;
            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, path, text)
                VALUES ('delete', old.id, old.path, old.text);
            END;
            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, path, text)
                VALUES ('delete', old.id, old.path, old.text);
                INSERT INTO chunks_fts(rowid, path, text) VALUES (new.id, new.path, new.text);
            END;",
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Insert a chunk and return its assigned id. Used by tests and the
    /// CLI demo to populate a store.
    pub fn insert_chunk(&self, chunk: &Chunk) -> anyhow::Result<i64> {
        let conn = self.conn.lock().expect("chunk store poisoned");
        let blob = embedding_to_blob(&chunk.embedding);
        conn.execute(
            "INSERT INTO chunks (path, start_line, end_line, text, embedding, source, updated_at, model)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chunk.path,
                chunk.start_line,
                chunk.end_line,
                chunk.text,
                blob,
                chunk.source,
                chunk.updated_at,
                chunk.model,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn all_candidates_sync(&self, model: &str, source: Option<&str>) -> Result<Vec<ChunkRow>, StoreError> {
        let conn = self.conn.lock().expect("chunk store poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, path, start_line, end_line, text, embedding, source, updated_at
             FROM chunks
             WHERE model = :model AND (:source IS NULL OR source = :source)",
        )?;
        let rows = stmt.query_map(
            rusqlite::named_params! { ":model": model, ":source": source },
            |row| {
                let blob: Vec<u8> = row.get(5)?;
                Ok(ChunkRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    start_line: row.get::<_, i64>(2)? as u32,
                    end_line: row.get::<_, i64>(3)? as u32,
                    text: row.get(4)?,
                    embedding: blob_to_embedding(&blob),
                    source: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn ensure_vector_ready(&self, _dim: usize) -> bool {
        false
    }

    async fn query_vector_topk(
        &self,
        model: &str,
        source: Option<&str>,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(ChunkRow, f64)>, StoreError> {
        let candidates = self.all_candidates_sync(model, source)?;
        let mut scored: Vec<(ChunkRow, f64)> = candidates
            .into_iter()
            .map(|row| {
                let dist = 1.0 - cosine_similarity(query, &row.embedding);
                (row, dist)
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn all_candidates(&self, model: &str, source: Option<&str>) -> Result<Vec<ChunkRow>, StoreError> {
        self.all_candidates_sync(model, source)
    }

    async fn fts_search(
        &self,
        model: &str,
        source: Option<&str>,
        fts_query: &str,
        limit: usize,
    ) -> Result<Vec<(ChunkRow, f64)>, StoreError> {
        let conn = self.conn.lock().expect("chunk store poisoned");
        let mut stmt = conn.prepare(
            "SELECT c.id, c.path, c.start_line, c.end_line, c.text, c.source, c.updated_at,
                    bm25(chunks_fts) AS rank
             FROM chunks_fts f
             JOIN chunks c ON c.id = f.rowid
             WHERE chunks_fts MATCH :query
               AND c.model = :model
               AND (:source IS NULL OR c.source = :source)
             ORDER BY rank ASC
             LIMIT :limit",
        )?;
        let rows = stmt.query_map(
            rusqlite::named_params! {
                ":query": fts_query,
                ":model": model,
                ":source": source,
                ":limit": limit as i64,
            },
            |row| {
                let rank: f64 = row.get(7)?;
                Ok((
                    ChunkRow {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        start_line: row.get::<_, i64>(2)? as u32,
                        end_line: row.get::<_, i64>(3)? as u32,
                        text: row.get(4)?,
                        embedding: Vec::new(),
                        source: row.get(5)?,
                        updated_at: row.get(6)?,
                    },
                    rank,
                ))
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn embedding_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes(bytes.try_into().expect("chunk size is 4")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, source: &str, embedding: Vec<f32>, updated_at: Option<i64>) -> Chunk {
        Chunk {
            id: 0,
            path: path.to_string(),
            start_line: 1,
            end_line: 10,
            source: source.to_string(),
            text: format!("contents of {path}"),
            embedding,
            updated_at,
            model: "test-embed".to_string(),
        }
    }

    fn temp_store() -> (tempfile::TempDir, SqliteChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteChunkStore::open_path(&dir.path().join("chunks.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn embedding_blob_roundtrip() {
        let original: Vec<f32> = vec![1.0, -0.5, 0.0, 3.14, -2.71];
        let blob = embedding_to_blob(&original);
        let recovered = blob_to_embedding(&blob);
        assert_eq!(original, recovered);
    }

    #[test]
    fn cosine_similarity_identical_vectors() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        let a = vec![1.0f32, 2.0];
        let b = vec![0.0f32, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn recency_penalty_future_or_missing_is_zero() {
        assert_eq!(calculate_recency_penalty(None, 1_000, 0.08, 14), 0.0);
        assert_eq!(calculate_recency_penalty(Some(2_000), 1_000, 0.08, 14), 0.0);
    }

    #[test]
    fn recency_penalty_half_window_scenario() {
        let now = 1_000_000_000i64;
        let updated_at = now - 7 * 86_400_000;
        let penalty = calculate_recency_penalty(Some(updated_at), now, 0.08, 14);
        assert!((penalty - 0.04).abs() < 1e-5);
    }

    #[test]
    fn recency_penalty_capped_at_lambda() {
        let now = 1_000_000_000i64;
        let updated_at = now - 30 * 86_400_000;
        let penalty = calculate_recency_penalty(Some(updated_at), now, 0.08, 14);
        assert!((penalty - 0.08).abs() < 1e-9);
    }

    #[test]
    fn truncate_snippet_respects_budget() {
        let s = truncate_snippet("hello world", 5);
        assert_eq!(s, "hello");
        assert_eq!(truncate_snippet("hi", 100), "hi");
    }

    #[test]
    fn truncate_snippet_does_not_split_surrogate_pair() {
        let emoji = "a😀b"; // 😀 is a surrogate pair in UTF-16 (2 units)
        // Budget lands exactly between the two halves of the emoji.
        let truncated = truncate_snippet(emoji, 2);
        assert_eq!(truncated, "a");
    }

    #[tokio::test]
    async fn fallback_vector_search_ranks_by_similarity() {
        let (_dir, store) = temp_store();
        store.insert_chunk(&chunk("north.rs", "repo", vec![0.0, 1.0], None)).unwrap();
        store.insert_chunk(&chunk("east.rs", "repo", vec![1.0, 0.0], None)).unwrap();

        let results = search_vector(
            &store,
            VectorSearchParams {
                query_vec: &[0.1, 0.95],
                limit: 10,
                model: "test-embed",
                source: None,
                recency: None,
                now: 0,
                snippet_max_chars: 200,
            },
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, "north.rs");
    }

    #[tokio::test]
    async fn vector_search_applies_recency_penalty_and_resorts() {
        let (_dir, store) = temp_store();
        let now = 1_000_000_000i64;
        // Slightly worse raw similarity, but much fresher.
        store.insert_chunk(&chunk("stale.rs", "repo", vec![1.0, 0.0], Some(now - 60 * 86_400_000))).unwrap();
        store.insert_chunk(&chunk("fresh.rs", "repo", vec![0.99, 0.01], Some(now))).unwrap();

        let recency = RecencyConfig { enabled: true, lambda: 0.5, window_days: 14 };
        let results = search_vector(
            &store,
            VectorSearchParams {
                query_vec: &[1.0, 0.0],
                limit: 10,
                model: "test-embed",
                source: None,
                recency: Some(&recency),
                now,
                snippet_max_chars: 200,
            },
        )
        .await
        .unwrap();

        assert_eq!(results[0].path, "fresh.rs");
        assert!(results.iter().all(|r| r.score >= 0.0));
    }

    #[tokio::test]
    async fn vector_search_empty_query_or_limit_is_empty() {
        let (_dir, store) = temp_store();
        store.insert_chunk(&chunk("a.rs", "repo", vec![1.0, 0.0], None)).unwrap();

        let empty_vec = search_vector(
            &store,
            VectorSearchParams { query_vec: &[], limit: 10, model: "test-embed", source: None, recency: None, now: 0, snippet_max_chars: 200 },
        )
        .await
        .unwrap();
        assert!(empty_vec.is_empty());

        let zero_limit = search_vector(
            &store,
            VectorSearchParams { query_vec: &[1.0], limit: 0, model: "test-embed", source: None, recency: None, now: 0, snippet_max_chars: 200 },
        )
        .await
        .unwrap();
        assert!(zero_limit.is_empty());
    }

    #[tokio::test]
    async fn vector_search_filters_by_source() {
        let (_dir, store) = temp_store();
        store.insert_chunk(&chunk("a.rs", "repo-1", vec![1.0, 0.0], None)).unwrap();
        store.insert_chunk(&chunk("b.rs", "repo-2", vec![1.0, 0.0], None)).unwrap();

        let results = search_vector(
            &store,
            VectorSearchParams {
                query_vec: &[1.0, 0.0],
                limit: 10,
                model: "test-embed",
                source: Some("repo-1"),
                recency: None,
                now: 0,
                snippet_max_chars: 200,
            },
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "a.rs");
    }

    #[tokio::test]
    async fn keyword_search_ranks_by_bm25() {
        let (_dir, store) = temp_store();
        let mut c1 = chunk("fruit.rs", "repo", vec![], None);
        c1.text = "apples and oranges are fruit".to_string();
        let mut c2 = chunk("pet.rs", "repo", vec![], None);
        c2.text = "the cat sleeps all day".to_string();
        store.insert_chunk(&c1).unwrap();
        store.insert_chunk(&c2).unwrap();

        let results = search_keyword(
            &store,
            KeywordSearchParams { query: "fruit", limit: 10, model: "test-embed", source: None, snippet_max_chars: 200 },
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "fruit.rs");
        assert!(results[0].score > 0.0);
    }

    #[tokio::test]
    async fn keyword_search_no_usable_terms_is_empty() {
        let (_dir, store) = temp_store();
        store.insert_chunk(&chunk("a.rs", "repo", vec![], None)).unwrap();
        let results = search_keyword(
            &store,
            KeywordSearchParams { query: "???", limit: 10, model: "test-embed", source: None, snippet_max_chars: 200 },
        )
        .await
        .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn keyword_search_respects_limit() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            let mut c = chunk(&format!("f{i}.rs"), "repo", vec![], None);
            c.text = "shared keyword across every chunk".to_string();
            store.insert_chunk(&c).unwrap();
        }
        let results = search_keyword(
            &store,
            KeywordSearchParams { query: "shared", limit: 2, model: "test-embed", source: None, snippet_max_chars: 200 },
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 2);
    }
}
