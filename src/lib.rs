//! `context-core` — the context-preservation core of a long-running
//! coding-assistant session: conversation compaction and hybrid memory
//! retrieval.
//!
//! See [`compaction`] for the conversation compaction engine and
//! [`memory`] for the hybrid memory retrieval engine. [`config`]
//! holds the runtime configuration registry both engines read from.

pub mod compaction;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod token;
