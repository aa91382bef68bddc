//! Shared data model for the compaction engine: messages, requests, and
//! the constants every other `compaction::*` module is tuned against.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Message content
// ---------------------------------------------------------------------------

/// A message's content: either a plain string, or an ordered sequence of
/// typed blocks (as a model API that supports mixed text/tool-use content
/// would emit). Extraction helpers skip block shapes they don't recognize
/// rather than failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

/// A single content block. Only `text` blocks contribute extracted text;
/// any other `block_type` (e.g. `tool_use`, `image`) is preserved but
/// ignored by text-extraction helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: Option<String>,
}

impl Content {
    /// Concatenate all plain text this content carries. For `Blocks`,
    /// joins every block whose `text` is present with `"\n"`.
    pub fn extract_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Free-form metadata carried by `toolResult` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResultDetails {
    pub status: Option<String>,
    pub exit_code: Option<i64>,
}

/// A single immutable message in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Content,
    /// Only meaningful for `role == "toolResult"`.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub details: Option<ToolResultDetails>,
}

impl Message {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Content::Text(text.into()),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            details: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }

    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == "toolResult"
    }

    /// Extracted plain text for this message, per `Content::extract_text`.
    pub fn extract_text(&self) -> String {
        self.content.extract_text()
    }
}

// ---------------------------------------------------------------------------
// File-ops tracking
// ---------------------------------------------------------------------------

/// The three disjoint file-operation sets a compaction request carries
/// in from the host runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileOps {
    #[serde(default)]
    pub read: BTreeSet<String>,
    #[serde(default)]
    pub edited: BTreeSet<String>,
    #[serde(default)]
    pub written: BTreeSet<String>,
}

/// Sorted, deduplicated file lists for the final artifact. `read` always
/// excludes anything that also appears modified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFileDetails {
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
}

impl FileOps {
    /// Compute the `(readFiles, modifiedFiles)` pair for the artifact:
    /// both sorted and deduplicated, with `readFiles ∩ modifiedFiles = ∅`.
    pub fn resolve(&self) -> ArtifactFileDetails {
        let modified: BTreeSet<&String> = self.edited.iter().chain(self.written.iter()).collect();
        let read_files: Vec<String> = self
            .read
            .iter()
            .filter(|p| !modified.contains(p))
            .cloned()
            .collect();
        let modified_files: Vec<String> = modified.into_iter().cloned().collect();
        ArtifactFileDetails {
            read_files,
            modified_files,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionSettings {
    #[serde(default)]
    pub reserve_tokens: u32,
}

/// Input to the compaction orchestrator.
#[derive(Debug, Clone)]
pub struct CompactionRequest {
    pub messages_to_summarize: Vec<Message>,
    /// Non-empty only when the cut falls inside a single turn.
    pub turn_prefix_messages: Vec<Message>,
    pub first_kept_entry_id: String,
    pub tokens_before: Option<u64>,
    pub previous_summary: Option<String>,
    pub settings: CompactionSettings,
    pub custom_instructions: Option<String>,
    pub signal: CancellationToken,
    pub file_ops: FileOps,
}

impl CompactionRequest {
    pub fn is_split_turn(&self) -> bool {
        !self.turn_prefix_messages.is_empty()
    }
}

/// Output of the compaction orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionArtifact {
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: Option<u64>,
    pub details: ArtifactFileDetails,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const FALLBACK_SUMMARY: &str =
    "The conversation history could not be summarized automatically. \
     Recent context has been preserved verbatim below.";

pub const MAX_TOOL_FAILURES: usize = 8;
pub const MAX_TOOL_FAILURE_CHARS: usize = 240;
pub const DEFAULT_RECENT_TURNS_PRESERVE: usize = 3;
pub const MAX_RECENT_TURNS_PRESERVE: usize = 12;
pub const DEFAULT_QUALITY_GUARD_MAX_RETRIES: usize = 1;
pub const MAX_QUALITY_GUARD_MAX_RETRIES: usize = 3;
pub const MAX_EXTRACTED_IDENTIFIERS: usize = 12;
pub const MAX_RECENT_TURN_TEXT_CHARS: usize = 600;
pub const MAX_SUMMARY_CONTEXT_CHARS: usize = 2000;
pub const SAFETY_MARGIN: f64 = 1.2;

/// Upper bound of the adaptive chunk ratio; also its return value
/// on empty input.
pub const BASE_CHUNK_RATIO: f64 = 0.25;
/// Lower bound of the adaptive chunk ratio.
pub const MIN_CHUNK_RATIO: f64 = 0.08;

pub const REQUIRED_SUMMARY_SECTIONS: [&str; 5] = [
    "## Decisions",
    "## Open TODOs",
    "## Constraints/Rules",
    "## Pending user asks",
    "## Exact identifiers",
];

pub const TURN_PREFIX_INSTRUCTIONS: &str =
    "Summarize only the partial turn shown below — it was cut off mid-turn \
     by the compaction boundary. Preserve what the user most recently asked \
     and any partial tool activity.";

pub const DROPPED_HISTORY_INSTRUCTIONS: &str =
    "Summarize the messages below concisely. They were dropped from the \
     summarizable window to make room for newer content, but any decisions, \
     constraints, or identifiers they carry should still feed forward into \
     the next summarization stage.";
