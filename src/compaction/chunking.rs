//! Chunk ratio planner and history pruner.
//!
//! An oldest-first removal loop over arbitrary message buckets, sized by
//! an adaptive chunk ratio that tightens as the input budget shrinks.

use tracing::debug;

use crate::compaction::types::{Message, BASE_CHUNK_RATIO, MIN_CHUNK_RATIO, SAFETY_MARGIN};
use crate::token::estimate_messages_tokens;

/// Compute the adaptive chunk ratio: the fraction of `context_window`
/// a single summarization chunk should target.
///
/// Returns `BASE_CHUNK_RATIO` for empty input. Otherwise scales down toward
/// `MIN_CHUNK_RATIO` as the average message grows past 10% of the context
/// window — large individual messages need smaller chunks so a chunk still
/// leaves headroom for the model's own response.
pub fn compute_adaptive_chunk_ratio(messages: &[Message], context_window: u64) -> f64 {
    if messages.is_empty() || context_window == 0 {
        return BASE_CHUNK_RATIO;
    }

    let total_tokens = estimate_messages_tokens(messages) as f64;
    let avg_tokens = total_tokens / messages.len() as f64;
    let avg_share = avg_tokens / context_window as f64;

    let tenth = 0.10;
    if avg_share <= tenth {
        return BASE_CHUNK_RATIO;
    }

    // Linearly interpolate down to MIN_CHUNK_RATIO as avg_share grows from
    // 10% to 50% of the window; clamp beyond that.
    let span = 0.5 - tenth;
    let t = ((avg_share - tenth) / span).clamp(0.0, 1.0);
    let ratio = BASE_CHUNK_RATIO - t * (BASE_CHUNK_RATIO - MIN_CHUNK_RATIO);
    ratio.clamp(MIN_CHUNK_RATIO, BASE_CHUNK_RATIO)
}

/// A single message is too large to summarize safely within the context
/// window: its own token cost, inflated by `SAFETY_MARGIN` to leave room
/// for the prompt wrapper and model response, exceeds half the window.
pub fn is_oversized_for_summary(msg: &Message, context_window: u64) -> bool {
    if context_window == 0 {
        return true;
    }
    let tokens = crate::token::estimate_message_tokens(msg) as f64;
    tokens * SAFETY_MARGIN > context_window as f64 * 0.5
}

/// Input to the history pruner.
pub struct PruneRequest<'a> {
    pub messages: &'a [Message],
    pub max_context_tokens: u64,
    pub max_history_share: f64,
    /// Number of coarse buckets to split `messages` into for removal
    /// granularity — derived from the chunk ratio by the caller.
    pub parts: usize,
}

/// Output of the history pruner.
#[derive(Debug, Clone)]
pub struct PruneResult {
    /// Surviving messages, in original order.
    pub kept: Vec<Message>,
    /// Number of whole buckets removed.
    pub dropped_chunks: usize,
    /// Every message removed, in original order, for audit/logging.
    pub dropped_messages_list: Vec<Message>,
}

/// Remove history oldest-first, in coarse buckets, until the kept messages
/// fit within `max_history_share` of `max_context_tokens`. Order among
/// surviving messages is always preserved; removal never reorders or
/// reaches past the oldest remaining bucket (no picking from the middle).
pub fn prune_history_for_context_share(req: PruneRequest<'_>) -> PruneResult {
    let budget = (req.max_context_tokens as f64 * req.max_history_share).floor() as u64;

    if req.messages.is_empty() || estimate_messages_tokens(req.messages) as u64 <= budget {
        return PruneResult {
            kept: req.messages.to_vec(),
            dropped_chunks: 0,
            dropped_messages_list: Vec::new(),
        };
    }

    let parts = req.parts.max(1).min(req.messages.len());
    let bucket_size = (req.messages.len() + parts - 1) / parts;

    let mut kept: Vec<Message> = req.messages.to_vec();
    let mut dropped_messages_list: Vec<Message> = Vec::new();
    let mut dropped_chunks = 0usize;

    while estimate_messages_tokens(&kept) as u64 > budget && !kept.is_empty() {
        let take = bucket_size.min(kept.len());
        let removed: Vec<Message> = kept.drain(0..take).collect();
        debug!(removed = removed.len(), remaining = kept.len(), "pruning oldest history bucket");
        dropped_messages_list.extend(removed);
        dropped_chunks += 1;
    }

    PruneResult {
        kept,
        dropped_chunks,
        dropped_messages_list,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> Message {
        Message::text("user", text)
    }

    #[test]
    fn empty_input_returns_base_ratio() {
        assert_eq!(compute_adaptive_chunk_ratio(&[], 100_000), BASE_CHUNK_RATIO);
    }

    #[test]
    fn small_messages_keep_base_ratio() {
        let msgs = vec![msg("hi"), msg("there")];
        assert_eq!(compute_adaptive_chunk_ratio(&msgs, 100_000), BASE_CHUNK_RATIO);
    }

    #[test]
    fn huge_messages_scale_toward_minimum() {
        let huge = "word ".repeat(20_000);
        let msgs = vec![msg(&huge)];
        let ratio = compute_adaptive_chunk_ratio(&msgs, 20_000);
        assert!(ratio < BASE_CHUNK_RATIO);
        assert!(ratio >= MIN_CHUNK_RATIO);
    }

    #[test]
    fn oversized_message_detected() {
        let huge = "word ".repeat(50_000);
        assert!(is_oversized_for_summary(&msg(&huge), 10_000));
        assert!(!is_oversized_for_summary(&msg("short"), 10_000));
    }

    #[test]
    fn prune_keeps_everything_under_budget() {
        let msgs = vec![msg("a"), msg("b"), msg("c")];
        let result = prune_history_for_context_share(PruneRequest {
            messages: &msgs,
            max_context_tokens: 1_000_000,
            max_history_share: 0.5,
            parts: 3,
        });
        assert_eq!(result.kept.len(), 3);
        assert_eq!(result.dropped_chunks, 0);
        assert!(result.dropped_messages_list.is_empty());
    }

    #[test]
    fn prune_drops_oldest_first_preserving_order() {
        let big = "word ".repeat(500);
        let msgs: Vec<Message> = (0..10).map(|i| msg(&format!("{big} {i}"))).collect();
        let result = prune_history_for_context_share(PruneRequest {
            messages: &msgs,
            max_context_tokens: 2_000,
            max_history_share: 0.5,
            parts: 5,
        });
        assert!(result.kept.len() < msgs.len());
        assert!(!result.dropped_messages_list.is_empty());
        // Surviving messages must be a contiguous suffix of the original order.
        let kept_texts: Vec<String> = result.kept.iter().map(|m| m.extract_text()).collect();
        let original_suffix: Vec<String> = msgs
            .iter()
            .rev()
            .take(kept_texts.len())
            .rev()
            .map(|m| m.extract_text())
            .collect();
        assert_eq!(kept_texts, original_suffix);
    }
}
