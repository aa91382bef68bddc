//! Quality guard: structural and content audits over a generated summary.
//!
//! Builds the structural prompt instructions, extracts opaque identifiers
//! a summary must not lose (hashes, URLs, paths, host:port pairs, long
//! digit runs), and audits a candidate summary against both the required
//! section headers and those identifiers.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::compaction::types::{MAX_EXTRACTED_IDENTIFIERS, REQUIRED_SUMMARY_SECTIONS};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"https?://\S+|[A-Za-z]:\\(?:[^\\\s]+\\)*[^\\\s]+|/(?:[\w.-]+/)+[\w.-]+|\b[0-9a-fA-F]{8,}\b|\b[\w.-]+:\d{1,5}\b|\b\d{6,}\b",
        )
        .expect("identifier pattern is a valid regex")
    })
}

const LEADING_WRAP: [char; 6] = ['(', '"', '\'', '[', '{', '<'];
const TRAILING_WRAP: [char; 12] = [')', ']', '"', '\'', ',', ';', ':', '.', '!', '?', '<', '>'];

fn strip_wrapping_punctuation(s: &str) -> &str {
    s.trim_start_matches(LEADING_WRAP.as_slice())
        .trim_end_matches(TRAILING_WRAP.as_slice())
}

/// Extract candidate "must not be lost" identifiers from `text`: hex runs
/// of 8+ characters, URLs, absolute POSIX/Windows paths, `host:port`
/// pairs, and digit runs of 6+. Matches are scanned in text order,
/// wrapping punctuation is stripped, anything shorter than 4 characters
/// after stripping is dropped, duplicates keep only their first
/// occurrence, and the result is capped at `MAX_EXTRACTED_IDENTIFIERS`.
pub fn extract_opaque_identifiers(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for m in identifier_pattern().find_iter(text) {
        let candidate = strip_wrapping_punctuation(m.as_str());
        if candidate.chars().count() < 4 {
            continue;
        }
        if seen.insert(candidate.to_string()) {
            out.push(candidate.to_string());
            if out.len() >= MAX_EXTRACTED_IDENTIFIERS {
                break;
            }
        }
    }

    out
}

/// Build the instructions a summarization prompt must include so the
/// model produces all five required sections, with any host-supplied
/// custom instructions appended afterward as an `Additional focus:` block.
pub fn build_compaction_structure_instructions(custom_instructions: Option<&str>) -> String {
    let mut out = String::from(
        "Produce a summary with exactly these Markdown section headers, in this order, \
         each populated (write \"None\" under a section with nothing to report):\n",
    );
    for section in REQUIRED_SUMMARY_SECTIONS {
        out.push_str("- ");
        out.push_str(section);
        out.push('\n');
    }
    out.push_str(
        "Preserve every exact identifier verbatim in \"## Exact identifiers\" — do not \
         paraphrase or truncate hashes, URLs, file paths, host:port pairs, or long numeric \
         IDs. Do not omit any user ask that remains unresolved.",
    );
    if let Some(custom) = custom_instructions {
        if !custom.trim().is_empty() {
            out.push_str("\n\nAdditional focus: ");
            out.push_str(custom.trim());
        }
    }
    out
}

/// Input to the audit step.
pub struct AuditRequest<'a> {
    pub summary: &'a str,
    pub identifiers: &'a [String],
    pub latest_ask: Option<&'a str>,
}

/// Result of auditing a candidate summary.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditResult {
    pub ok: bool,
    pub reasons: Vec<String>,
}

/// Audit a candidate summary against its required structure, its seed
/// identifiers, and (when known) the latest user ask.
pub fn audit_summary_quality(req: AuditRequest<'_>) -> AuditResult {
    let mut reasons = Vec::new();

    for section in REQUIRED_SUMMARY_SECTIONS {
        if !req.summary.contains(section) {
            reasons.push(format!("missing_section:{section}"));
        }
    }

    let missing_identifiers: Vec<&str> = req
        .identifiers
        .iter()
        .filter(|id| !req.summary.contains(id.as_str()))
        .map(|id| id.as_str())
        .collect();
    if !missing_identifiers.is_empty() {
        let joined = missing_identifiers
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        reasons.push(format!("missing_identifiers:{joined}"));
    }

    if let Some(ask) = req.latest_ask {
        let tokens: Vec<String> = ask
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 5)
            .take(8)
            .map(|t| t.to_lowercase())
            .collect();
        if !tokens.is_empty() {
            let lower_summary = req.summary.to_lowercase();
            if !tokens.iter().any(|t| lower_summary.contains(t.as_str())) {
                reasons.push("latest_user_ask_not_reflected".to_string());
            }
        }
    }

    AuditResult {
        ok: reasons.is_empty(),
        reasons,
    }
}
