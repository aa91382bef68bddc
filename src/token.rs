//! Token estimation for compaction budgeting.
//!
//! Real BPE tokenisation via `tiktoken-rs` rather than a char-count
//! heuristic: an accurate count costs nothing extra to maintain and every
//! downstream ratio computation is only as good as this number.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use crate::compaction::types::Message;

/// Cached BPE tokenizer — built once, reused on every call.
fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::o200k_base().expect("failed to load o200k_base tokeniser"))
}

/// Per-message overhead tokens, to account for role/framing tokens a real
/// chat completion API adds around each message. A stable calibration
/// constant callers may rely on for ratio math.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Token estimate for a single message: its extracted text plus its role
/// string plus per-message overhead.
pub fn estimate_message_tokens(msg: &Message) -> usize {
    let enc = bpe();
    enc.encode_with_special_tokens(&msg.extract_text()).len()
        + enc.encode_with_special_tokens(&msg.role).len()
        + MESSAGE_OVERHEAD_TOKENS
}

/// Token estimate for a sequence of messages. Monotonic: appending a
/// message to `msgs` can never decrease this sum, since every per-message
/// term is non-negative.
pub fn estimate_messages_tokens(msgs: &[Message]) -> usize {
    msgs.iter().map(estimate_message_tokens).sum()
}

/// Token estimate for a plain string (used by the compaction-prompt
/// machinery, outside the `Message` framing).
pub fn estimate_text_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}
