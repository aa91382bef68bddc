//! Staged summarizer.
//!
//! Segments an oversized message run into chunks, then chains them through
//! the model client sequentially — each stage's prompt carries forward the
//! previous stage's output as `previous_summary`, so the chain never loses
//! earlier context even though no single call sees the whole transcript.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::compaction::chunking::is_oversized_for_summary;
use crate::compaction::types::Message;
use crate::token::estimate_messages_tokens;

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("compaction was cancelled")]
    Cancelled,
    #[error("model client unavailable")]
    ModelUnavailable,
    #[error("model call failed: {0}")]
    ModelCallFailed(String),
}

/// A single completion request sent to the external model client.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub api_key: Option<String>,
    pub prompt: String,
    pub reserve_tokens: u32,
    pub signal: CancellationToken,
}

/// The language-model client boundary. No HTTP-backed implementation
/// lives in this crate — callers supply their own.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<String, CompactionError>;
}

/// Deterministic canned-response client for tests and the CLI demo. Never
/// used as a real summarizer — there is no HTTP-backed implementation in
/// this crate.
pub struct StubModelClient;

#[async_trait]
impl ModelClient for StubModelClient {
    async fn complete(&self, req: CompletionRequest) -> Result<String, CompactionError> {
        if req.signal.is_cancelled() {
            return Err(CompactionError::Cancelled);
        }
        Ok(format!(
            "## Decisions\n(stub)\n\n## Open TODOs\n(stub)\n\n## Constraints/Rules\n(stub)\n\n\
             ## Pending user asks\n(stub)\n\n## Exact identifiers\n(stub)\n\n[summarized {} chars of prompt]",
            req.prompt.len()
        ))
    }
}

/// Parameters for a staged summarization run.
pub struct SummarizeRequest<'a> {
    pub messages: &'a [Message],
    pub previous_summary: Option<&'a str>,
    pub model: &'a str,
    pub api_key: Option<&'a str>,
    pub context_window: u64,
    /// Per-segment token budget, derived by the caller from
    /// `compute_adaptive_chunk_ratio` over the full summarizable set
    /// (§4.6) — `segment_messages` uses this verbatim rather than
    /// recomputing its own ratio over just `messages`.
    pub max_chunk_tokens: u64,
    pub reserve_tokens: u32,
    pub instructions: &'a str,
    pub signal: CancellationToken,
}

/// Split `messages` into contiguous segments, each sized so its estimated
/// tokens stay under `chunk_budget`. A single oversized message becomes
/// its own one-message segment — the caller's prompt-building step is
/// responsible for truncating it at the budget rather than erroring out.
fn segment_messages(messages: &[Message], context_window: u64, chunk_budget: u64) -> Vec<Vec<Message>> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut segments: Vec<Vec<Message>> = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens: u64 = 0;

    for msg in messages {
        if is_oversized_for_summary(msg, context_window) {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            segments.push(vec![msg.clone()]);
            continue;
        }

        let msg_tokens = estimate_messages_tokens(std::slice::from_ref(msg)) as u64;
        if !current.is_empty() && current_tokens + msg_tokens > chunk_budget {
            segments.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += msg_tokens;
        current.push(msg.clone());
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

fn build_stage_prompt(instructions: &str, previous_summary: Option<&str>, segment: &[Message]) -> String {
    let mut prompt = String::new();
    prompt.push_str(instructions);
    prompt.push('\n');
    if let Some(prev) = previous_summary {
        prompt.push_str("\n## Summary so far\n");
        prompt.push_str(prev);
        prompt.push('\n');
    }
    prompt.push_str("\n## Messages to fold in\n");
    for msg in segment {
        prompt.push_str(&format!("[{}] {}\n", msg.role, msg.extract_text()));
    }
    prompt
}

/// Run the staged summarization chain, one segment at a time, never in
/// parallel — each stage must see the prior stage's output.
pub async fn summarize_in_stages(
    req: SummarizeRequest<'_>,
    client: &dyn ModelClient,
) -> Result<String, CompactionError> {
    let segments = segment_messages(req.messages, req.context_window, req.max_chunk_tokens);
    if segments.is_empty() {
        return Ok(req.previous_summary.unwrap_or_default().to_string());
    }

    let mut carried_summary = req.previous_summary.map(|s| s.to_string());

    for (idx, segment) in segments.iter().enumerate() {
        if req.signal.is_cancelled() {
            warn!(stage = idx, total = segments.len(), "summarization cancelled mid-chain");
            return Err(CompactionError::Cancelled);
        }

        debug!(stage = idx, total = segments.len(), messages = segment.len(), "summarizing stage");

        let prompt = build_stage_prompt(req.instructions, carried_summary.as_deref(), segment);

        let completion_req = CompletionRequest {
            model: req.model.to_string(),
            api_key: req.api_key.map(|s| s.to_string()),
            prompt,
            reserve_tokens: req.reserve_tokens,
            signal: req.signal.clone(),
        };

        let result = client.complete(completion_req).await?;
        carried_summary = Some(result);
    }

    Ok(carried_summary.unwrap_or_default())
}
