//! # csync
//!
//! Command-line front end for the incremental vector sync engine.
//!
//! ```bash
//! csync --config ./config/csync.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `csync init` | Create the metadata store and vector index |
//! | `csync collections` | List collections and their sync state |
//! | `csync sync <name>` | Run an incremental sync pass |
//! | `csync status <name>` | Show a collection's sync status |
//! | `csync search "<query>"` | Semantic search, optionally scoped |
//! | `csync delete-vectors <name>` | Drop a collection's vectors and mappings |
//! | `csync forget <name>` | Drop everything stored for a collection |
//! | `csync drift <name>` | Show the reconciliation log |
//!
//! Logs go to stderr and are controlled with `RUST_LOG`
//! (default `collection_sync=info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use collection_sync::config;
use collection_sync::engine::SyncEngine;
use collection_sync::index::SqliteVectorIndex;
use collection_sync::metadata::MetadataStore;
use collection_sync::models::{ChunkType, SyncState};
use collection_sync::progress::{self, ProgressMode};
use collection_sync::search::{self, SearchRequest};
use collection_sync::stats;

/// Keep vector indexes in step with user-managed text collections.
#[derive(Parser)]
#[command(name = "csync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/csync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the metadata store and vector index. Safe to run repeatedly.
    Init,

    /// List collections known to the collection root with their sync state.
    Collections {
        #[arg(long)]
        json: bool,
    },

    /// Bring a collection's vectors up to date.
    Sync {
        /// Collection name (a sub-directory of `[collections].root`).
        collection: String,

        /// Re-chunk and re-embed every file, not just changed ones.
        #[arg(long)]
        full: bool,

        /// Progress on stderr: `off`, `human`, or `json`.
        /// Defaults to `human` when stderr is a TTY.
        #[arg(long)]
        progress: Option<String>,

        /// Print the outcome as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the sync status of a collection.
    Status {
        collection: String,
        #[arg(long)]
        json: bool,
    },

    /// Semantic search over synced chunks.
    Search {
        query: String,

        /// Restrict to one collection. Omit to search all collections.
        #[arg(long)]
        collection: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity.
        #[arg(long)]
        threshold: Option<f32>,

        /// Only return chunks of this type (`text`, `code`, `table`, `list`).
        /// May be repeated.
        #[arg(long = "type")]
        chunk_types: Vec<String>,

        /// Include the chunks each hit overlaps with.
        #[arg(long)]
        expand: bool,

        #[arg(long)]
        json: bool,
    },

    /// Remove all vectors and mappings for a collection.
    DeleteVectors { collection: String },

    /// Remove every trace of a collection: vectors, mappings, status, drift log.
    Forget { collection: String },

    /// Show detected drift for a collection, newest first.
    Drift {
        collection: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collection_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = MetadataStore::open(&cfg.db.path)
                .await
                .context("Failed to initialize metadata store")?;
            store.close().await;
            if cfg.index.backend == "sqlite" {
                let index = SqliteVectorIndex::open(&cfg.index_path())
                    .await
                    .context("Failed to initialize vector index")?;
                index.close().await;
            }
            std::fs::create_dir_all(cfg.collections_root()).with_context(|| {
                format!(
                    "Failed to create collection root: {}",
                    cfg.collections_root().display()
                )
            })?;
            println!("ok");
        }
        Commands::Collections { json } => {
            let engine = SyncEngine::open(&cfg).await?;
            stats::run_collections(&engine, json).await?;
            engine.close().await;
        }
        Commands::Sync {
            collection,
            full,
            progress: mode,
            json,
        } => {
            let mode = match mode.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(m) => match ProgressMode::parse(m) {
                    Some(mode) => mode,
                    None => bail!("Unknown progress mode: '{}'. Use off, human, or json.", m),
                },
            };

            let engine = SyncEngine::open(&cfg).await?;
            let reporter = progress::spawn_reporter(engine.subscribe(), mode.reporter());
            let result = engine.trigger_sync(&collection, full).await;
            match &result {
                // Let the reporter drain up to the Finished event
                Ok(_) => {
                    let _ = tokio::time::timeout(Duration::from_secs(1), reporter).await;
                }
                Err(_) => reporter.abort(),
            }

            let outcome = result?;
            let status = engine.get_sync_status(&collection).await?;
            if json {
                let value = serde_json::json!({ "outcome": outcome, "status": status });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                stats::print_sync_summary(
                    &status,
                    outcome.files_processed,
                    outcome.files_failed,
                    outcome.files_skipped,
                );
            }
            engine.close().await;

            if outcome.status == SyncState::Error {
                bail!("sync of '{}' failed", collection);
            }
        }
        Commands::Status { collection, json } => {
            let engine = SyncEngine::open(&cfg).await?;
            stats::run_status(&engine, &collection, json).await?;
            engine.close().await;
        }
        Commands::Search {
            query,
            collection,
            limit,
            threshold,
            chunk_types,
            expand,
            json,
        } => {
            let chunk_types = chunk_types
                .iter()
                .map(|t| {
                    ChunkType::parse(t).with_context(|| {
                        format!("Unknown chunk type: '{}'. Use text, code, table, or list.", t)
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let request = SearchRequest {
                query,
                collection_name: collection,
                k: limit,
                score_threshold: threshold,
                chunk_types,
                expand_overlaps: expand,
            };
            let engine = SyncEngine::open(&cfg).await?;
            let hits = engine.search(&request).await?;
            search::print_hits(&hits, json)?;
            engine.close().await;
        }
        Commands::DeleteVectors { collection } => {
            let engine = SyncEngine::open(&cfg).await?;
            let removed = engine.delete_collection_vectors(&collection).await?;
            println!("deleted {} vectors from {}", removed, collection);
            engine.close().await;
        }
        Commands::Forget { collection } => {
            let engine = SyncEngine::open(&cfg).await?;
            if engine.forget_collection(&collection).await? {
                println!("forgot {}", collection);
            } else {
                println!("nothing stored for {}", collection);
            }
            engine.close().await;
        }
        Commands::Drift {
            collection,
            limit,
            json,
        } => {
            let engine = SyncEngine::open(&cfg).await?;
            stats::run_drift(&engine, &collection, limit, json).await?;
            engine.close().await;
        }
    }

    Ok(())
}
