//! # collection-sync
//!
//! Keeps a vector index in step with user-managed text collections.
//!
//! Each sync pass diffs a collection's files against the mappings recorded
//! by the previous pass and only re-chunks and re-embeds what changed.
//! Every file is committed on its own, so a failed or cancelled pass keeps
//! its progress and the next pass picks up the rest. Search is scoped to a
//! collection inside the index query.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │  Collection  │──▶│     Sync Orchestrator     │──▶│ Vector Index │
//! │   Provider   │   │ diff → chunk → embed → ⇅ │   │ sqlite/memory│
//! └──────────────┘   └────────────┬─────────────┘   └──────┬───────┘
//!                                 │                        │
//!                                 ▼                        ▼
//!                        ┌────────────────┐        ┌────────────┐
//!                        │ Metadata Store │        │   Search   │
//!                        │    (SQLite)    │        └────────────┘
//!                        └────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | `SyncEngine`: public operations, locking, worker pool |
//! | [`sync`] | One sync pass and its progress events |
//! | [`change`] | Added / modified / deleted detection |
//! | [`chunk`] | Structure-aware and paragraph chunking |
//! | [`embedding`] | Embedding provider trait and implementations |
//! | [`index`] | Vector index trait, SQLite and in-memory backends |
//! | [`metadata`] | Collections, status, mappings, reconciliation log |
//! | [`provider`] | File collection providers (filesystem, in-memory) |
//! | [`cache`] | LRU cache of per-collection sync handles |
//! | [`retry`] | Bounded exponential backoff |
//! | [`search`] | Scoped semantic search |
//! | [`config`] | TOML configuration |
//! | [`error`] | `SyncError` |
//! | [`progress`], [`stats`] | CLI output |

pub mod cache;
pub mod change;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod search;
pub mod stats;
pub mod sync;

pub use engine::{EngineOptions, EngineParts, SyncEngine, SyncJob};
pub use error::{Result, SyncError};
