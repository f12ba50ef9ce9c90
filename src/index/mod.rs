//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the storage seam for embeddings: records are
//! keyed by chunk id and carry the chunk's text and structural metadata so
//! search results can be rendered without a round-trip to the metadata store.
//!
//! Two backends ship with the crate:
//! - [`SqliteVectorIndex`]: a separate SQLite database, brute-force cosine
//!   over rows pre-filtered in SQL.
//! - [`InMemoryVectorIndex`]: `RwLock<HashMap>`, for tests and ephemeral use.
//!
//! [`VectorIndexAdapter`] wraps a backend with chunk-aware helpers used by the
//! sync orchestrator and search.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::models::{Chunk, ChunkType, FileVectorMapping};

/// One stored vector with its chunk metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub collection_name: String,
    pub file_path: String,
    pub chunk_index: i64,
    pub chunk_type: ChunkType,
    pub text: String,
    pub content_hash: String,
    pub header_path: Vec<String>,
    pub line_start: usize,
    pub line_end: usize,
    pub overlap_source: Vec<String>,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            id: chunk.id.clone(),
            collection_name: chunk.collection_name.clone(),
            file_path: chunk.file_path.clone(),
            chunk_index: chunk.chunk_index,
            chunk_type: chunk.chunk_type,
            text: chunk.text.clone(),
            content_hash: chunk.content_hash.clone(),
            header_path: chunk.header_path.clone(),
            line_start: chunk.line_start,
            line_end: chunk.line_end,
            overlap_source: chunk.overlap_source.clone(),
            vector,
        }
    }
}

/// Metadata predicate applied inside the index, before top-k selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    pub collection_name: Option<String>,
    /// Empty means any type.
    pub chunk_types: Vec<ChunkType>,
}

impl MetadataFilter {
    pub fn collection(name: &str) -> Self {
        Self {
            collection_name: Some(name.to_string()),
            chunk_types: Vec::new(),
        }
    }

    pub fn matches(&self, record: &VectorRecord) -> bool {
        if let Some(c) = &self.collection_name {
            if &record.collection_name != c {
                return false;
            }
        }
        self.chunk_types.is_empty() || self.chunk_types.contains(&record.chunk_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: VectorRecord,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

/// Storage backend for embeddings.
///
/// Implementations must apply `filter` and `threshold` before truncating to
/// `k`, so a filtered query always returns up to `k` matching records.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()>;

    /// Delete records by id. Unknown ids are ignored. Returns rows removed.
    async fn delete(&self, ids: &[String]) -> Result<u64>;

    async fn delete_by_collection(&self, collection_name: &str) -> Result<u64>;

    /// Subset of `ids` present in the index.
    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    /// Top-`k` records by cosine similarity with score `>= threshold`,
    /// highest first, ties broken by id.
    async fn query(
        &self,
        vector: &[f32],
        filter: &MetadataFilter,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>>;

    async fn count(&self, filter: &MetadataFilter) -> Result<u64>;
}

/// Sort by score descending then id, and keep the first `k`.
pub(crate) fn rank(mut hits: Vec<ScoredRecord>, k: usize) -> Vec<ScoredRecord> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(k);
    hits
}

/// Chunk-aware facade over a [`VectorIndex`] backend.
#[derive(Clone)]
pub struct VectorIndexAdapter {
    backend: Arc<dyn VectorIndex>,
}

impl VectorIndexAdapter {
    pub fn new(backend: Arc<dyn VectorIndex>) -> Self {
        Self { backend }
    }

    /// Store `vectors[i]` for `chunks[i]`.
    pub async fn upsert_chunks(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(SyncError::Validation(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if chunks.is_empty() {
            return Ok(());
        }
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(c, v)| VectorRecord::from_chunk(c, v.clone()))
            .collect();
        self.backend.upsert(&records).await
    }

    pub async fn delete_chunks(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.backend.delete(ids).await
    }

    pub async fn delete_collection(&self, collection_name: &str) -> Result<u64> {
        self.backend.delete_by_collection(collection_name).await
    }

    pub async fn search(
        &self,
        vector: &[f32],
        filter: &MetadataFilter,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.backend.query(vector, filter, k, threshold).await
    }

    pub async fn get_chunks(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.backend.get(ids).await
    }

    /// Number of the mapping's chunk ids the index cannot resolve.
    pub async fn missing_count(&self, mapping: &FileVectorMapping) -> Result<usize> {
        if mapping.chunk_ids.is_empty() {
            return Ok(0);
        }
        let present = self.backend.existing_ids(&mapping.chunk_ids).await?;
        Ok(mapping
            .chunk_ids
            .iter()
            .filter(|id| !present.contains(*id))
            .count())
    }

    /// Fails with [`SyncError::CorruptMapping`] when any mapped id is gone.
    pub async fn verify_mapping(&self, mapping: &FileVectorMapping) -> Result<()> {
        let missing = self.missing_count(mapping).await?;
        if missing > 0 {
            return Err(SyncError::CorruptMapping {
                collection: mapping.collection_name.clone(),
                file_path: mapping.file_path.clone(),
                missing,
            });
        }
        Ok(())
    }

    pub async fn count_collection(&self, collection_name: &str) -> Result<u64> {
        self.backend
            .count(&MetadataFilter::collection(collection_name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, collection: &str) -> Chunk {
        Chunk {
            id: id.into(),
            collection_name: collection.into(),
            file_path: "a.md".into(),
            chunk_index: 0,
            text: "text".into(),
            content_hash: "h".into(),
            chunk_type: ChunkType::Text,
            header_path: vec![],
            line_start: 1,
            line_end: 1,
            overlap_source: vec![],
        }
    }

    #[tokio::test]
    async fn test_verify_mapping_detects_missing() {
        let adapter = VectorIndexAdapter::new(Arc::new(InMemoryVectorIndex::new()));
        adapter
            .upsert_chunks(&[chunk("1", "docs")], &[vec![1.0, 0.0]])
            .await
            .unwrap();

        let mut mapping = FileVectorMapping {
            collection_name: "docs".into(),
            file_path: "a.md".into(),
            file_hash_at_sync: "x".into(),
            chunk_ids: vec!["1".into()],
            chunk_count: 1,
            last_synced_at: 0,
            processing_time_ms: 0,
            strategy_fingerprint: String::new(),
        };
        adapter.verify_mapping(&mapping).await.unwrap();

        mapping.chunk_ids.push("2".into());
        match adapter.verify_mapping(&mapping).await {
            Err(SyncError::CorruptMapping { missing, .. }) => assert_eq!(missing, 1),
            other => panic!("expected CorruptMapping, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_length_mismatch_rejected() {
        let adapter = VectorIndexAdapter::new(Arc::new(InMemoryVectorIndex::new()));
        let err = adapter
            .upsert_chunks(&[chunk("1", "docs")], &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_filter_matches() {
        let rec = VectorRecord::from_chunk(&chunk("1", "docs"), vec![]);
        assert!(MetadataFilter::default().matches(&rec));
        assert!(MetadataFilter::collection("docs").matches(&rec));
        assert!(!MetadataFilter::collection("other").matches(&rec));
        let code_only = MetadataFilter {
            collection_name: None,
            chunk_types: vec![ChunkType::Code],
        };
        assert!(!code_only.matches(&rec));
    }
}
