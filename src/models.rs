//! Core data models used throughout the sync engine.
//!
//! These types represent the collections, file snapshots, chunks, mappings,
//! and sync status rows that flow between the change detector, chunker,
//! vector index, and metadata store.
//!
//! All timestamps are Unix epoch **milliseconds** (`i64`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A collection as reported by the file collection provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub description: String,
    pub created_at: i64,
}

/// Point-in-time view of one file in a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub collection_name: String,
    /// Logical path inside the collection, `/`-separated (e.g. `guides/a.md`).
    pub path: String,
    pub content: String,
    /// Hex SHA-256 of `content`.
    pub content_hash: String,
    pub size: u64,
    pub modified_at: i64,
}

/// Structural type of a chunk, used for retrieval-time filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    Code,
    Table,
    List,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::Code => "code",
            ChunkType::Table => "table",
            ChunkType::List => "list",
        }
    }

    /// Parse from the string stored in the index.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ChunkType::Text),
            "code" => Some(ChunkType::Code),
            "table" => Some(ChunkType::Table),
            "list" => Some(ChunkType::List),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk of a file's text, the unit of embedding and retrieval.
///
/// Chunks are never stored as content in the metadata store; their text
/// lives in the vector index alongside the embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// Deterministic id, see [`crate::chunk::chunk_id`].
    pub id: String,
    pub collection_name: String,
    pub file_path: String,
    pub chunk_index: i64,
    pub text: String,
    /// Hex SHA-256 of `text`.
    pub content_hash: String,
    pub chunk_type: ChunkType,
    /// Enclosing markdown headings, outermost first.
    pub header_path: Vec<String>,
    /// 1-based, inclusive.
    pub line_start: usize,
    /// 1-based, inclusive.
    pub line_end: usize,
    /// Ids of adjacent chunks that share overlapping text with this one.
    pub overlap_source: Vec<String>,
}

/// Durable link between a file's last-synced content and its chunk ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileVectorMapping {
    pub collection_name: String,
    pub file_path: String,
    pub file_hash_at_sync: String,
    pub chunk_ids: Vec<String>,
    pub chunk_count: i64,
    pub last_synced_at: i64,
    /// Wall time spent chunking, embedding and committing the file.
    pub processing_time_ms: i64,
    /// Chunking strategy and embedding model the vectors were built with.
    pub strategy_fingerprint: String,
}

/// Sync lifecycle state of a collection.
///
/// ```text
/// never_synced ─▶ in_progress ─▶ completed | partial | error
///                      ▲                    │
///                      └────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NeverSynced,
    InProgress,
    Completed,
    Error,
    Partial,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NeverSynced => "never_synced",
            SyncState::InProgress => "in_progress",
            SyncState::Completed => "completed",
            SyncState::Error => "error",
            SyncState::Partial => "partial",
        }
    }

    /// Parse from string (as stored in SQLite).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never_synced" => Some(SyncState::NeverSynced),
            "in_progress" => Some(SyncState::InProgress),
            "completed" => Some(SyncState::Completed),
            "error" => Some(SyncState::Error),
            "partial" => Some(SyncState::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Completed | SyncState::Error | SyncState::Partial
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a collection's `sync_status` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub collection_name: String,
    pub status: SyncState,
    pub last_sync_at: Option<i64>,
    pub last_sync_attempt_at: Option<i64>,
    pub vector_count: i64,
    pub file_count: i64,
    pub changed_files_count: i64,
    pub error_message: Option<String>,
    /// Fingerprint of the chunking strategy used by the last pass.
    pub strategy_fingerprint: Option<String>,
}

impl SyncStatus {
    /// Status reported for a collection with no `sync_status` row yet.
    pub fn never_synced(collection_name: &str) -> Self {
        Self {
            collection_name: collection_name.to_string(),
            status: SyncState::NeverSynced,
            last_sync_at: None,
            last_sync_attempt_at: None,
            vector_count: 0,
            file_count: 0,
            changed_files_count: 0,
            error_message: None,
            strategy_fingerprint: None,
        }
    }
}

/// Kind of drift recorded in the reconciliation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// File present at the provider with no mapping.
    Added,
    /// File content hash differs from `file_hash_at_sync`.
    Modified,
    /// Mapping present with no file at the provider.
    Deleted,
    /// Mapped chunk ids not resolvable in the index.
    MissingVectors,
    /// Superseded vectors that could not be removed from the index.
    OrphanedVectors,
}

impl DriftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftKind::Added => "added",
            DriftKind::Modified => "modified",
            DriftKind::Deleted => "deleted",
            DriftKind::MissingVectors => "missing_vectors",
            DriftKind::OrphanedVectors => "orphaned_vectors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(DriftKind::Added),
            "modified" => Some(DriftKind::Modified),
            "deleted" => Some(DriftKind::Deleted),
            "missing_vectors" => Some(DriftKind::MissingVectors),
            "orphaned_vectors" => Some(DriftKind::OrphanedVectors),
            _ => None,
        }
    }
}

/// One row of the append-only reconciliation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    pub id: i64,
    pub collection_name: String,
    pub file_path: String,
    pub kind: DriftKind,
    pub detail: Option<String>,
    pub detected_at: i64,
}

/// A file that could not be synced during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file_path: String,
    pub error: String,
}

/// Result of a single `TriggerSync` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub collection_name: String,
    pub run_id: String,
    pub status: SyncState,
    /// Added/modified/deleted files committed in this pass.
    pub files_processed: u64,
    pub files_failed: u64,
    /// Files never attempted because the pass was cancelled.
    pub files_skipped: u64,
    pub chunks_written: u64,
    pub failures: Vec<FileFailure>,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
