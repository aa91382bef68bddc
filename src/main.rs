use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;

use context_core::compaction::{self, CompactionRequest, OrchestratorContext};
use context_core::compaction::types::{CompactionSettings, FileOps, Message};
use context_core::config::{RuntimeConfigRegistry, SafeguardSettings};
use context_core::error::ContextCoreError;
use context_core::memory::{self, KeywordSearchParams, SqliteChunkStore, VectorSearchParams};

#[derive(Parser, Debug)]
#[command(name = "context-core", version, about = "Conversation compaction and hybrid memory retrieval demo CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a compaction request (loaded from JSON) through the orchestrator
    /// with a stub model client and print the resulting artifact.
    Compact {
        /// Path to a `CompactionRequestDto`-shaped JSON file.
        #[arg(long)]
        input: PathBuf,
        /// Path to a YAML `SafeguardSettings` file; defaults are used if omitted.
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Run a hybrid-retrieval query against a chunk store and print the
    /// ranked results.
    Search {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        query: String,
        #[arg(long, value_enum, default_value_t = SearchMode::Hybrid)]
        mode: SearchMode,
        #[arg(long, default_value = "demo-embed")]
        model: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SearchMode {
    Hybrid,
    Vector,
    Keyword,
}

/// JSON-loadable shell of a `CompactionRequest` — identical except it has
/// no cancellation token (the CLI always runs to completion).
#[derive(Debug, serde::Deserialize)]
struct CompactionRequestDto {
    messages_to_summarize: Vec<Message>,
    #[serde(default)]
    turn_prefix_messages: Vec<Message>,
    first_kept_entry_id: String,
    #[serde(default)]
    tokens_before: Option<u64>,
    #[serde(default)]
    previous_summary: Option<String>,
    #[serde(default)]
    settings: CompactionSettings,
    #[serde(default)]
    custom_instructions: Option<String>,
    #[serde(default)]
    file_ops: FileOps,
}

impl From<CompactionRequestDto> for CompactionRequest {
    fn from(dto: CompactionRequestDto) -> Self {
        CompactionRequest {
            messages_to_summarize: dto.messages_to_summarize,
            turn_prefix_messages: dto.turn_prefix_messages,
            first_kept_entry_id: dto.first_kept_entry_id,
            tokens_before: dto.tokens_before,
            previous_summary: dto.previous_summary,
            settings: dto.settings,
            custom_instructions: dto.custom_instructions,
            signal: CancellationToken::new(),
            file_ops: dto.file_ops,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    context_core::logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Compact { input, settings } => run_compact(input, settings).await,
        Command::Search { db, query, mode, model, source, limit } => {
            run_search(db, query, mode, model, source, limit).await
        }
    };

    // Both subcommands funnel through `ContextCoreError` so the CLI has a
    // single error type to report, regardless of which engine failed.
    result.map_err(anyhow::Error::from)
}

async fn run_compact(input: PathBuf, settings_path: Option<PathBuf>) -> Result<(), ContextCoreError> {
    let raw = tokio::fs::read_to_string(&input)
        .await
        .with_context(|| format!("reading compaction request from {}", input.display()))?;
    let dto: CompactionRequestDto =
        serde_json::from_str(&raw).with_context(|| format!("parsing compaction request at {}", input.display()))?;
    let request: CompactionRequest = dto.into();

    let settings = match settings_path {
        Some(path) => SafeguardSettings::load(&path).await?,
        None => SafeguardSettings::default(),
    };

    let registry = RuntimeConfigRegistry::new();
    let client = compaction::summarizer::StubModelClient;

    info!(messages = request.messages_to_summarize.len(), "running compaction");

    let artifact = compaction::orchestrate(
        request,
        OrchestratorContext {
            model: Some("demo-model"),
            api_key: Some("demo-key"),
            session_manager_id: "cli",
            registry: &registry,
            settings: &settings,
            default_context_window: 128_000,
            client: &client,
            workspace_rules_path: None,
        },
    )
    .await;

    let rendered = serde_json::to_string_pretty(&artifact_json(&artifact)).map_err(anyhow::Error::from)?;
    println!("{rendered}");
    Ok(())
}

/// `CompactionArtifact` has no `Serialize` impl of its own (it carries a
/// `CancellationToken`-free but otherwise plain shape) — project it into
/// a small printable record for the CLI.
fn artifact_json(artifact: &compaction::CompactionArtifact) -> serde_json::Value {
    serde_json::json!({
        "summary": artifact.summary,
        "firstKeptEntryId": artifact.first_kept_entry_id,
        "tokensBefore": artifact.tokens_before,
        "details": {
            "readFiles": artifact.details.read_files,
            "modifiedFiles": artifact.details.modified_files,
        }
    })
}

async fn run_search(
    db: PathBuf,
    query: String,
    mode: SearchMode,
    model: String,
    source: Option<String>,
    limit: usize,
) -> Result<(), ContextCoreError> {
    let store = SqliteChunkStore::open_path(&db).map_err(anyhow::Error::from)?;
    let settings = SafeguardSettings::default();

    let vector_query = demo_query_embedding(&query);
    let now = chrono::Utc::now().timestamp_millis();

    let results = match mode {
        SearchMode::Vector => {
            memory::search_vector(
                &store,
                VectorSearchParams {
                    query_vec: &vector_query,
                    limit,
                    model: &model,
                    source: source.as_deref(),
                    recency: Some(&settings.recency),
                    now,
                    snippet_max_chars: 200,
                },
            )
            .await?
            .into_iter()
            .map(|v| serde_json::json!({"path": v.path, "score": v.score, "snippet": v.snippet}))
            .collect::<Vec<_>>()
        }
        SearchMode::Keyword => {
            memory::search_keyword(
                &store,
                KeywordSearchParams {
                    query: &query,
                    limit,
                    model: &model,
                    source: source.as_deref(),
                    snippet_max_chars: 200,
                },
            )
            .await?
            .into_iter()
            .map(|k| serde_json::json!({"path": k.path, "score": k.score, "snippet": k.snippet}))
            .collect::<Vec<_>>()
        }
        SearchMode::Hybrid => {
            let vector = memory::search_vector(
                &store,
                VectorSearchParams {
                    query_vec: &vector_query,
                    limit,
                    model: &model,
                    source: source.as_deref(),
                    recency: Some(&settings.recency),
                    now,
                    snippet_max_chars: 200,
                },
            )
            .await?;
            let keyword = memory::search_keyword(
                &store,
                KeywordSearchParams {
                    query: &query,
                    limit,
                    model: &model,
                    source: source.as_deref(),
                    snippet_max_chars: 200,
                },
            )
            .await?;
            let merged = memory::merge_hybrid_results(memory::MergeParams {
                vector: &vector,
                keyword: &keyword,
                vector_weight: settings.vector_weight,
                text_weight: settings.text_weight,
                dynamic_threshold: settings.dynamic_threshold,
            });
            merged
                .into_iter()
                .map(|r| serde_json::json!({"path": r.path, "score": r.score, "snippet": r.snippet}))
                .collect::<Vec<_>>()
        }
    };

    let rendered = serde_json::to_string_pretty(&results).map_err(anyhow::Error::from)?;
    println!("{rendered}");
    Ok(())
}

/// The embeddings provider is an external collaborator this CLI has
/// nothing real to call, so it derives a toy embedding from the query
/// text purely so `search --mode vector|hybrid` has something to rank
/// against without a network dependency.
fn demo_query_embedding(query: &str) -> Vec<f32> {
    let mut buckets = [0f32; 16];
    for (i, byte) in query.bytes().enumerate() {
        buckets[i % buckets.len()] += byte as f32;
    }
    buckets.to_vec()
}
