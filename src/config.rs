//! Compaction/retrieval configuration surface and the runtime config
//! registry.
//!
//! `SafeguardSettings` is the YAML-loadable surface, read with
//! `anyhow::Context`-wrapped I/O errors. `SafeguardRuntime`/
//! `RuntimeConfigRegistry` implement a process-wide per-session-manager
//! override map: runtime overrides beat YAML settings, which beat
//! hard-coded defaults.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::compaction::types::{
    DEFAULT_QUALITY_GUARD_MAX_RETRIES, DEFAULT_RECENT_TURNS_PRESERVE, MAX_QUALITY_GUARD_MAX_RETRIES,
    MAX_RECENT_TURNS_PRESERVE,
};

fn default_max_history_share() -> f64 {
    0.5
}

fn default_recent_turns_preserve() -> usize {
    DEFAULT_RECENT_TURNS_PRESERVE
}

fn default_quality_guard_enabled() -> bool {
    true
}

fn default_quality_guard_max_retries() -> usize {
    DEFAULT_QUALITY_GUARD_MAX_RETRIES
}

fn default_recency_enabled() -> bool {
    false
}

fn default_recency_lambda() -> f64 {
    0.08
}

fn default_recency_window_days() -> u32 {
    14
}

fn default_vector_weight() -> f64 {
    0.5
}

fn default_text_weight() -> f64 {
    0.5
}

fn default_dynamic_threshold() -> bool {
    true
}

/// Recency-penalty configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RecencyConfig {
    #[serde(default = "default_recency_enabled")]
    pub enabled: bool,
    #[serde(default = "default_recency_lambda")]
    pub lambda: f64,
    #[serde(default = "default_recency_window_days")]
    pub window_days: u32,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            enabled: default_recency_enabled(),
            lambda: default_recency_lambda(),
            window_days: default_recency_window_days(),
        }
    }
}

/// YAML-loadable configuration surface, covering both compaction knobs
/// and hybrid-retrieval weighting.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SafeguardSettings {
    #[serde(default = "default_max_history_share")]
    pub max_history_share: f64,
    #[serde(default)]
    pub context_window_tokens: Option<u64>,
    #[serde(default = "default_recent_turns_preserve")]
    pub recent_turns_preserve: usize,
    #[serde(default = "default_quality_guard_enabled")]
    pub quality_guard_enabled: bool,
    #[serde(default = "default_quality_guard_max_retries")]
    pub quality_guard_max_retries: usize,
    #[serde(default)]
    pub recency: RecencyConfig,
    #[serde(default = "default_dynamic_threshold")]
    pub dynamic_threshold: bool,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
}

impl Default for SafeguardSettings {
    fn default() -> Self {
        Self {
            max_history_share: default_max_history_share(),
            context_window_tokens: None,
            recent_turns_preserve: default_recent_turns_preserve(),
            quality_guard_enabled: default_quality_guard_enabled(),
            quality_guard_max_retries: default_quality_guard_max_retries(),
            recency: RecencyConfig::default(),
            dynamic_threshold: default_dynamic_threshold(),
            vector_weight: default_vector_weight(),
            text_weight: default_text_weight(),
        }
    }
}

impl SafeguardSettings {
    /// Read and parse a YAML settings file.
    pub async fn load(path: &Path) -> anyhow::Result<SafeguardSettings> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading safeguard settings from {}", path.display()))?;
        let settings: SafeguardSettings = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing safeguard settings at {}", path.display()))?;
        Ok(settings.clamped())
    }

    /// Clamp the retry/preserve knobs into their allowed ranges.
    pub fn clamped(mut self) -> Self {
        self.recent_turns_preserve = self.recent_turns_preserve.min(MAX_RECENT_TURNS_PRESERVE);
        self.quality_guard_max_retries = self.quality_guard_max_retries.min(MAX_QUALITY_GUARD_MAX_RETRIES);
        self
    }
}

/// Per-session-manager override record. Every field is optional — only
/// knobs a host actually wants to override are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafeguardRuntime {
    pub context_window_tokens: Option<u64>,
    pub recent_turns_preserve: Option<usize>,
    pub quality_guard_enabled: Option<bool>,
    pub quality_guard_max_retries: Option<usize>,
    pub max_history_share: Option<f64>,
}

/// Fully-resolved knobs the orchestrator reads for one compaction
/// request: runtime override layered over YAML settings layered over
/// hard-coded defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSafeguards {
    pub context_window_tokens: u64,
    pub recent_turns_preserve: usize,
    pub quality_guard_enabled: bool,
    pub quality_guard_max_retries: usize,
    pub max_history_share: f64,
}

/// Identifies the session manager a runtime override belongs to.
pub type SessionManagerId = String;

/// Process-wide registry of per-session-manager runtime overrides.
#[derive(Default)]
pub struct RuntimeConfigRegistry {
    entries: Mutex<HashMap<SessionManagerId, SafeguardRuntime>>,
}

impl RuntimeConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the override for `id`. Passing `None` clears any existing entry.
    pub fn set(&self, id: SessionManagerId, runtime: Option<SafeguardRuntime>) {
        let mut entries = self.entries.lock().expect("runtime config registry poisoned");
        match runtime {
            Some(runtime) => {
                entries.insert(id, runtime);
            }
            None => {
                entries.remove(&id);
            }
        }
    }

    /// Look up the override for `id`. Unknown keys return `None`.
    pub fn get(&self, id: &str) -> Option<SafeguardRuntime> {
        self.entries.lock().expect("runtime config registry poisoned").get(id).cloned()
    }

    /// Resolve final knobs for a compaction request: `runtime` overrides
    /// beat `settings`, which beat hard-coded defaults. `default_context_window`
    /// is the model-declared window, used when nothing else specifies one.
    pub fn resolved(
        &self,
        id: &str,
        settings: &SafeguardSettings,
        default_context_window: u64,
    ) -> ResolvedSafeguards {
        let runtime = self.get(id);

        let context_window_tokens = runtime
            .as_ref()
            .and_then(|r| r.context_window_tokens)
            .or(settings.context_window_tokens)
            .unwrap_or(default_context_window);

        let recent_turns_preserve = runtime
            .as_ref()
            .and_then(|r| r.recent_turns_preserve)
            .unwrap_or(settings.recent_turns_preserve)
            .min(MAX_RECENT_TURNS_PRESERVE);

        let quality_guard_enabled = runtime
            .as_ref()
            .and_then(|r| r.quality_guard_enabled)
            .unwrap_or(settings.quality_guard_enabled);

        let quality_guard_max_retries = runtime
            .as_ref()
            .and_then(|r| r.quality_guard_max_retries)
            .unwrap_or(settings.quality_guard_max_retries)
            .min(MAX_QUALITY_GUARD_MAX_RETRIES);

        let max_history_share = runtime
            .as_ref()
            .and_then(|r| r.max_history_share)
            .unwrap_or(settings.max_history_share);

        ResolvedSafeguards {
            context_window_tokens,
            recent_turns_preserve,
            quality_guard_enabled,
            quality_guard_max_retries,
            max_history_share,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_sane() {
        let settings = SafeguardSettings::default();
        assert_eq!(settings.max_history_share, 0.5);
        assert_eq!(settings.recent_turns_preserve, DEFAULT_RECENT_TURNS_PRESERVE);
        assert!(settings.quality_guard_enabled);
        assert_eq!(settings.quality_guard_max_retries, DEFAULT_QUALITY_GUARD_MAX_RETRIES);
        assert!(!settings.recency.enabled);
    }

    #[test]
    fn unknown_session_manager_resolves_to_defaults() {
        let registry = RuntimeConfigRegistry::new();
        let settings = SafeguardSettings::default();
        let resolved = registry.resolved("unknown", &settings, 128_000);
        assert_eq!(resolved.context_window_tokens, 128_000);
        assert_eq!(resolved.recent_turns_preserve, DEFAULT_RECENT_TURNS_PRESERVE);
    }

    #[test]
    fn runtime_override_beats_settings() {
        let registry = RuntimeConfigRegistry::new();
        registry.set(
            "session-a".to_string(),
            Some(SafeguardRuntime {
                recent_turns_preserve: Some(9),
                ..Default::default()
            }),
        );
        let settings = SafeguardSettings::default();
        let resolved = registry.resolved("session-a", &settings, 128_000);
        assert_eq!(resolved.recent_turns_preserve, 9);
    }

    #[test]
    fn overrides_are_clamped() {
        let registry = RuntimeConfigRegistry::new();
        registry.set(
            "session-b".to_string(),
            Some(SafeguardRuntime {
                recent_turns_preserve: Some(999),
                quality_guard_max_retries: Some(999),
                ..Default::default()
            }),
        );
        let settings = SafeguardSettings::default();
        let resolved = registry.resolved("session-b", &settings, 128_000);
        assert_eq!(resolved.recent_turns_preserve, MAX_RECENT_TURNS_PRESERVE);
        assert_eq!(resolved.quality_guard_max_retries, MAX_QUALITY_GUARD_MAX_RETRIES);
    }

    #[test]
    fn set_none_clears_entry() {
        let registry = RuntimeConfigRegistry::new();
        registry.set("session-c".to_string(), Some(SafeguardRuntime::default()));
        assert!(registry.get("session-c").is_some());
        registry.set("session-c".to_string(), None);
        assert!(registry.get("session-c").is_none());
    }

    #[test]
    fn entries_isolated_per_session_manager() {
        let registry = RuntimeConfigRegistry::new();
        registry.set(
            "a".to_string(),
            Some(SafeguardRuntime {
                max_history_share: Some(0.9),
                ..Default::default()
            }),
        );
        registry.set(
            "b".to_string(),
            Some(SafeguardRuntime {
                max_history_share: Some(0.2),
                ..Default::default()
            }),
        );
        let settings = SafeguardSettings::default();
        assert_eq!(registry.resolved("a", &settings, 10_000).max_history_share, 0.9);
        assert_eq!(registry.resolved("b", &settings, 10_000).max_history_share, 0.2);
    }
}
