//! Compaction orchestrator: the top-level state machine.
//!
//! `PRUNE → PRESERVE_TAIL → SUMMARIZE (with quality-guard retry) → ASSEMBLE`,
//! always producing a `CompactionArtifact` — on any error it falls back to
//! a safe verbatim-preserving artifact rather than propagating the error
//! to the caller.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::compaction::chunking::{compute_adaptive_chunk_ratio, prune_history_for_context_share, PruneRequest};
use crate::compaction::quality::{audit_summary_quality, build_compaction_structure_instructions, extract_opaque_identifiers, AuditRequest};
use crate::compaction::summarizer::{summarize_in_stages, ModelClient, SummarizeRequest};
use crate::compaction::types::{
    ArtifactFileDetails, CompactionArtifact, CompactionRequest, DROPPED_HISTORY_INSTRUCTIONS, FALLBACK_SUMMARY,
    MAX_RECENT_TURN_TEXT_CHARS, MAX_SUMMARY_CONTEXT_CHARS, MAX_TOOL_FAILURES, MAX_TOOL_FAILURE_CHARS, SAFETY_MARGIN,
    TURN_PREFIX_INSTRUCTIONS,
};
use crate::compaction::types::Message;
use crate::config::{ResolvedSafeguards, RuntimeConfigRegistry, SafeguardSettings};
use crate::token::estimate_messages_tokens;

/// Everything the orchestrator needs beyond the request itself.
pub struct OrchestratorContext<'a> {
    pub model: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub session_manager_id: &'a str,
    pub registry: &'a RuntimeConfigRegistry,
    pub settings: &'a SafeguardSettings,
    pub default_context_window: u64,
    pub client: &'a dyn ModelClient,
    /// Defaults to `AGENTS.md` in the current directory; overridable for tests.
    pub workspace_rules_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Tool-failure digest
// ---------------------------------------------------------------------------

struct ToolFailureEntry {
    tool_name: String,
    meta: String,
    summary: String,
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}...")
}

fn extract_tool_failures(messages: &[Message]) -> Vec<ToolFailureEntry> {
    let mut seen_ids = HashSet::new();
    let mut out = Vec::new();

    for msg in messages {
        if !msg.is_tool_result() || !msg.is_error {
            continue;
        }
        let Some(id) = msg.tool_call_id.clone() else {
            continue;
        };
        if !seen_ids.insert(id) {
            continue;
        }

        let tool_name = msg.tool_name.clone().unwrap_or_else(|| "tool".to_string());
        let text = collapse_whitespace(&msg.extract_text());

        let mut meta_parts = Vec::new();
        if let Some(details) = &msg.details {
            if let Some(status) = &details.status {
                meta_parts.push(format!("status={status}"));
            }
            if let Some(code) = details.exit_code {
                meta_parts.push(format!("exitCode={code}"));
            }
        }
        let has_meta = !meta_parts.is_empty();
        let meta = if has_meta {
            format!(" ({})", meta_parts.join(" "))
        } else {
            String::new()
        };

        let summary = if text.is_empty() {
            if has_meta { "failed".to_string() } else { "failed (no output)".to_string() }
        } else {
            truncate_with_ellipsis(&text, MAX_TOOL_FAILURE_CHARS)
        };

        out.push(ToolFailureEntry { tool_name, meta, summary });
    }

    out
}

fn format_tool_failure_section(failures: &[ToolFailureEntry]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let mut lines: Vec<String> = failures
        .iter()
        .take(MAX_TOOL_FAILURES)
        .map(|f| format!("- {}{}: {}", f.tool_name, f.meta, f.summary))
        .collect();
    if failures.len() > MAX_TOOL_FAILURES {
        lines.push(format!("- ...and {} more", failures.len() - MAX_TOOL_FAILURES));
    }
    format!("## Tool Failures\n{}", lines.join("\n"))
}

// ---------------------------------------------------------------------------
// File-ops section
// ---------------------------------------------------------------------------

fn format_file_ops_section(details: &ArtifactFileDetails) -> String {
    if details.read_files.is_empty() && details.modified_files.is_empty() {
        return String::new();
    }
    let mut block = String::new();
    if !details.read_files.is_empty() {
        block.push_str("<read-files>\n");
        block.push_str(&details.read_files.join("\n"));
        block.push_str("\n</read-files>");
    }
    if !details.modified_files.is_empty() {
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str("<modified-files>\n");
        block.push_str(&details.modified_files.join("\n"));
        block.push_str("\n</modified-files>");
    }
    format!("\n\n{block}")
}

// ---------------------------------------------------------------------------
// Workspace rules
// ---------------------------------------------------------------------------

fn heading_title(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    trimmed.starts_with('#').then(|| trimmed.trim_start_matches('#').trim().to_string())
}

fn parse_markdown_section(text: &str, heading: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|line| heading_title(line).is_some_and(|t| t.eq_ignore_ascii_case(heading)))?
        + 1;
    let end = lines[start..]
        .iter()
        .position(|line| heading_title(line).is_some())
        .map(|offset| start + offset)
        .unwrap_or(lines.len());
    let section = lines[start..end].join("\n").trim().to_string();
    (!section.is_empty()).then_some(section)
}

async fn read_workspace_rules(path: &Path) -> String {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(_) => return String::new(),
    };

    let mut sections = Vec::new();
    if let Some(s) = parse_markdown_section(&contents, "Session Startup") {
        sections.push(s);
    }
    if let Some(s) = parse_markdown_section(&contents, "Red Lines") {
        sections.push(s);
    }
    if sections.is_empty() {
        return String::new();
    }

    let combined = sections.join("\n\n");
    let body = if combined.chars().count() > MAX_SUMMARY_CONTEXT_CHARS {
        let truncated: String = combined.chars().take(MAX_SUMMARY_CONTEXT_CHARS).collect();
        format!("{truncated}\n...[truncated]...")
    } else {
        combined
    };

    format!("\n\n<workspace-critical-rules>{body}</workspace-critical-rules>")
}

// ---------------------------------------------------------------------------
// PRESERVE_TAIL
// ---------------------------------------------------------------------------

fn split_preserved_recent_turns(messages: &[Message], recent_turns_preserve: usize) -> (Vec<Message>, Vec<Message>) {
    let target = 2 * recent_turns_preserve;
    let mut selected_indices = Vec::new();

    for (idx, msg) in messages.iter().enumerate().rev() {
        if selected_indices.len() >= target {
            break;
        }
        if msg.is_user() || msg.is_assistant() {
            selected_indices.push(idx);
        }
    }
    selected_indices.sort_unstable();
    let selected: HashSet<usize> = selected_indices.iter().copied().collect();

    let preserved_tail: Vec<Message> = selected_indices.iter().map(|&i| messages[i].clone()).collect();
    let summarizable: Vec<Message> = messages
        .iter()
        .enumerate()
        .filter(|(i, _)| !selected.contains(i))
        .map(|(_, m)| m.clone())
        .collect();

    (summarizable, preserved_tail)
}

fn format_preserved_tail_section(tail: &[Message]) -> String {
    let lines: Vec<String> = tail
        .iter()
        .filter_map(|msg| {
            let text = msg.extract_text();
            if text.trim().is_empty() {
                return None;
            }
            let label = if msg.is_user() { "User" } else { "Assistant" };
            Some(format!("- {label}: {}", truncate_with_ellipsis(&text, MAX_RECENT_TURN_TEXT_CHARS)))
        })
        .collect();

    if lines.is_empty() {
        return String::new();
    }
    format!("## Recent turns preserved verbatim\n{}", lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

fn fallback_artifact(request: &CompactionRequest, tool_failure_section: &str, file_ops_section: &str) -> CompactionArtifact {
    CompactionArtifact {
        summary: format!("{FALLBACK_SUMMARY}{tool_failure_section}{file_ops_section}"),
        first_kept_entry_id: request.first_kept_entry_id.clone(),
        tokens_before: request.tokens_before,
        details: request.file_ops.resolve(),
    }
}

fn last_user_text(groups: &[&[Message]]) -> Option<String> {
    groups
        .iter()
        .flat_map(|g| g.iter())
        .rev()
        .find(|m| m.is_user())
        .map(|m| m.extract_text())
}

/// Run the full compaction state machine, never propagating an error — any
/// failure during SUMMARIZE degrades to the fallback artifact.
pub async fn orchestrate(request: CompactionRequest, ctx: OrchestratorContext<'_>) -> CompactionArtifact {
    let details = request.file_ops.resolve();
    let tool_failures = extract_tool_failures(&request.messages_to_summarize);
    let tool_failure_section = format_tool_failure_section(&tool_failures);
    let file_ops_section = format_file_ops_section(&details);

    let (Some(model), Some(api_key)) = (ctx.model, ctx.api_key) else {
        return fallback_artifact(&request, &tool_failure_section, &file_ops_section);
    };

    let resolved: ResolvedSafeguards = ctx.registry.resolved(ctx.session_manager_id, ctx.settings, ctx.default_context_window);
    let context_window = resolved.context_window_tokens;

    // PRUNE
    let mut dropped_summary: Option<String> = None;
    let mut messages = request.messages_to_summarize.clone();
    if let Some(tokens_before) = request.tokens_before {
        let summarizable_tokens = estimate_messages_tokens(&messages) + estimate_messages_tokens(&request.turn_prefix_messages);
        let new_content_tokens = (tokens_before as i64 - summarizable_tokens as i64).max(0) as u64;
        let limit = (context_window as f64 * resolved.max_history_share * SAFETY_MARGIN).floor() as u64;
        if new_content_tokens > limit {
            let prune_result = prune_history_for_context_share(PruneRequest {
                messages: &messages,
                max_context_tokens: context_window,
                max_history_share: resolved.max_history_share,
                parts: 2,
            });
            if prune_result.dropped_chunks > 0 {
                warn!(dropped_chunks = prune_result.dropped_chunks, "pruned history chunks before summarization");
                if !prune_result.dropped_messages_list.is_empty() {
                    let dropped_ratio = compute_adaptive_chunk_ratio(&prune_result.dropped_messages_list, context_window);
                    let dropped_max_chunk_tokens = ((context_window as f64 * dropped_ratio).floor() as u64).max(1);
                    let dropped_request = SummarizeRequest {
                        messages: &prune_result.dropped_messages_list,
                        previous_summary: None,
                        model,
                        api_key: Some(api_key),
                        context_window,
                        max_chunk_tokens: dropped_max_chunk_tokens,
                        reserve_tokens: request.settings.reserve_tokens,
                        instructions: DROPPED_HISTORY_INSTRUCTIONS,
                        signal: request.signal.clone(),
                    };
                    match summarize_in_stages(dropped_request, ctx.client).await {
                        Ok(summary) => dropped_summary = Some(summary),
                        Err(err) => warn!(error = %err, "failed to summarize dropped history, continuing without it"),
                    }
                }
            }
            messages = prune_result.kept;
        }
    }

    // PRESERVE_TAIL
    let (summarizable, preserved_tail) = split_preserved_recent_turns(&messages, resolved.recent_turns_preserve);
    let preserved_tail_section = format_preserved_tail_section(&preserved_tail);

    // SUMMARIZE
    let latest_user_ask = last_user_text(&[&summarizable, &preserved_tail, &request.turn_prefix_messages]);

    let mut identifier_source_groups: Vec<&Message> = summarizable.iter().chain(preserved_tail.iter()).collect();
    let tail_start = identifier_source_groups.len().saturating_sub(10);
    let identifier_source: String = identifier_source_groups
        .split_off(tail_start)
        .iter()
        .map(|m| m.extract_text())
        .collect::<Vec<_>>()
        .join("\n");
    let seed_identifiers = extract_opaque_identifiers(&identifier_source);

    let structured_instructions = build_compaction_structure_instructions(request.custom_instructions.as_deref());

    let mut combined_for_ratio: Vec<Message> = summarizable.clone();
    combined_for_ratio.extend(request.turn_prefix_messages.iter().cloned());
    let adaptive_ratio = compute_adaptive_chunk_ratio(&combined_for_ratio, context_window);
    let max_chunk_tokens = ((context_window as f64 * adaptive_ratio).floor() as u64).max(1);

    let effective_previous_summary = dropped_summary.clone().or_else(|| request.previous_summary.clone());

    let total_attempts = if resolved.quality_guard_enabled { resolved.quality_guard_max_retries + 1 } else { 1 };
    let mut current_instructions = structured_instructions.clone();
    let mut summary = String::new();

    for attempt in 0..total_attempts {
        let history_result = summarize_in_stages(
            SummarizeRequest {
                messages: &summarizable,
                previous_summary: effective_previous_summary.as_deref(),
                model,
                api_key: Some(api_key),
                context_window,
                max_chunk_tokens,
                reserve_tokens: request.settings.reserve_tokens,
                instructions: &current_instructions,
                signal: request.signal.clone(),
            },
            ctx.client,
        )
        .await;

        let history_summary = match history_result {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "summarization failed, returning fallback artifact");
                return fallback_artifact(&request, &tool_failure_section, &file_ops_section);
            }
        };

        summary = if request.is_split_turn() && !request.turn_prefix_messages.is_empty() {
            let prefix_instructions = format!("{TURN_PREFIX_INSTRUCTIONS}\n\n{current_instructions}");
            let prefix_result = summarize_in_stages(
                SummarizeRequest {
                    messages: &request.turn_prefix_messages,
                    previous_summary: None,
                    model,
                    api_key: Some(api_key),
                    context_window,
                    max_chunk_tokens,
                    reserve_tokens: request.settings.reserve_tokens,
                    instructions: &prefix_instructions,
                    signal: request.signal.clone(),
                },
                ctx.client,
            )
            .await;
            match prefix_result {
                Ok(prefix_summary) => format!("{history_summary}\n\n---\n\n**Turn Context (split turn):**\n\n{prefix_summary}"),
                Err(err) => {
                    warn!(error = %err, "split-turn prefix summarization failed, returning fallback artifact");
                    return fallback_artifact(&request, &tool_failure_section, &file_ops_section);
                }
            }
        } else {
            history_summary
        };

        if !preserved_tail_section.is_empty() {
            summary = format!("{summary}\n\n{preserved_tail_section}");
        }

        let is_last_attempt = attempt + 1 == total_attempts;
        if !resolved.quality_guard_enabled || is_last_attempt {
            break;
        }

        let audit = audit_summary_quality(AuditRequest {
            summary: &summary,
            identifiers: &seed_identifiers,
            latest_ask: latest_user_ask.as_deref(),
        });
        if audit.ok {
            break;
        }

        current_instructions = format!(
            "{structured_instructions}\n\nPrevious summary failed quality checks ({}). \
             Fix all issues and include every required section with exact identifiers preserved.",
            audit.reasons.join(", ")
        );
    }

    // ASSEMBLE
    let workspace_rules_path = ctx
        .workspace_rules_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("AGENTS.md"));
    let workspace_rules_section = read_workspace_rules(&workspace_rules_path).await;

    summary = format!("{summary}{tool_failure_section}{file_ops_section}{workspace_rules_section}");

    CompactionArtifact {
        summary,
        first_kept_entry_id: request.first_kept_entry_id.clone(),
        tokens_before: request.tokens_before,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::summarizer::StubModelClient;
    use crate::compaction::types::{CompactionSettings, FileOps, ToolResultDetails};
    use tokio_util::sync::CancellationToken;

    fn msg(role: &str, text: &str) -> Message {
        Message::text(role, text)
    }

    fn tool_failure(id: &str, name: &str, text: &str, status: Option<&str>, exit_code: Option<i64>) -> Message {
        Message {
            role: "toolResult".into(),
            content: crate::compaction::types::Content::Text(text.into()),
            tool_call_id: Some(id.into()),
            tool_name: Some(name.into()),
            is_error: true,
            details: Some(ToolResultDetails {
                status: status.map(|s| s.to_string()),
                exit_code,
            }),
        }
    }

    #[test]
    fn tool_failure_digest_matches_literal_scenario() {
        let messages = vec![
            tool_failure("1", "exec", "ENOENT: missing file", Some("failed"), Some(1)),
            msg("assistant", "ok"),
        ];
        let failures = extract_tool_failures(&messages);
        let section = format_tool_failure_section(&failures);
        assert!(section.starts_with("## Tool Failures"));
        assert!(section.contains("exec (status=failed exitCode=1): ENOENT: missing file"));
    }

    #[test]
    fn tool_failures_dedupe_by_call_id() {
        let messages = vec![
            tool_failure("1", "exec", "first", None, None),
            tool_failure("1", "exec", "second", None, None),
        ];
        assert_eq!(extract_tool_failures(&messages).len(), 1);
    }

    #[test]
    fn split_preserved_recent_turns_zero_is_identity() {
        let messages = vec![msg("user", "a"), msg("assistant", "b")];
        let (summarizable, tail) = split_preserved_recent_turns(&messages, 0);
        assert_eq!(summarizable, messages);
        assert!(tail.is_empty());
    }

    #[test]
    fn split_preserved_recent_turns_takes_newest_first() {
        let messages = vec![
            msg("user", "one"),
            msg("assistant", "two"),
            msg("user", "three"),
            msg("assistant", "four"),
        ];
        let (summarizable, tail) = split_preserved_recent_turns(&messages, 1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].extract_text(), "three");
        assert_eq!(tail[1].extract_text(), "four");
        assert_eq!(summarizable.len(), 2);
    }

    #[test]
    fn file_ops_section_omits_empty_sets() {
        let details = ArtifactFileDetails::default();
        assert_eq!(format_file_ops_section(&details), "");
    }

    #[test]
    fn file_ops_section_formats_both() {
        let details = ArtifactFileDetails {
            read_files: vec!["a.rs".into()],
            modified_files: vec!["b.rs".into()],
        };
        let section = format_file_ops_section(&details);
        assert!(section.starts_with("\n\n"));
        assert!(section.contains("<read-files>\na.rs\n</read-files>"));
        assert!(section.contains("<modified-files>\nb.rs\n</modified-files>"));
    }

    #[tokio::test]
    async fn no_model_yields_fallback_artifact() {
        let request = CompactionRequest {
            messages_to_summarize: vec![msg("user", "hi")],
            turn_prefix_messages: vec![],
            first_kept_entry_id: "entry-1".into(),
            tokens_before: None,
            previous_summary: None,
            settings: CompactionSettings::default(),
            custom_instructions: None,
            signal: CancellationToken::new(),
            file_ops: FileOps::default(),
        };
        let registry = RuntimeConfigRegistry::new();
        let settings = SafeguardSettings::default();
        let client = StubModelClient;
        let artifact = orchestrate(
            request,
            OrchestratorContext {
                model: None,
                api_key: None,
                session_manager_id: "s1",
                registry: &registry,
                settings: &settings,
                default_context_window: 128_000,
                client: &client,
                workspace_rules_path: Some(PathBuf::from("/nonexistent/AGENTS.md")),
            },
        )
        .await;
        assert!(artifact.summary.starts_with(FALLBACK_SUMMARY));
    }

    #[tokio::test]
    async fn happy_path_produces_structured_summary() {
        let messages: Vec<Message> = (0..8).map(|i| msg(if i % 2 == 0 { "user" } else { "assistant" }, &format!("turn {i}"))).collect();
        let request = CompactionRequest {
            messages_to_summarize: messages,
            turn_prefix_messages: vec![],
            first_kept_entry_id: "entry-9".into(),
            tokens_before: Some(500),
            previous_summary: None,
            settings: CompactionSettings { reserve_tokens: 256 },
            custom_instructions: None,
            signal: CancellationToken::new(),
            file_ops: FileOps::default(),
        };
        let registry = RuntimeConfigRegistry::new();
        let settings = SafeguardSettings::default();
        let client = StubModelClient;
        let artifact = orchestrate(
            request,
            OrchestratorContext {
                model: Some("test-model"),
                api_key: Some("key"),
                session_manager_id: "s1",
                registry: &registry,
                settings: &settings,
                default_context_window: 128_000,
                client: &client,
                workspace_rules_path: Some(PathBuf::from("/nonexistent/AGENTS.md")),
            },
        )
        .await;
        assert!(artifact.summary.contains("## Decisions"));
        assert_eq!(artifact.first_kept_entry_id, "entry-9");
    }
}
