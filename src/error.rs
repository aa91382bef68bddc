//! Crate-wide error type for the CLI surface. The library engines
//! themselves use narrower errors (`compaction::CompactionError`,
//! `memory::StoreError`) or never fail at all (the orchestrator always
//! returns an artifact, falling back rather than propagating) — this
//! enum only exists to give `main.rs` one type to bubble CLI failures
//! through.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextCoreError {
    #[error(transparent)]
    Store(#[from] crate::memory::StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
