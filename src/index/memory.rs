//! In-memory [`VectorIndex`] for tests and ephemeral use.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Search is brute-force cosine
//! similarity over the records that pass the metadata filter.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::error::{Result, SyncError};

use super::{rank, MetadataFilter, ScoredRecord, VectorIndex, VectorRecord};

#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, VectorRecord>>> {
        self.records
            .read()
            .map_err(|_| SyncError::VectorIndex("index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, VectorRecord>>> {
        self.records
            .write()
            .map_err(|_| SyncError::VectorIndex("index lock poisoned".to_string()))
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut stored = self.write()?;
        for r in records {
            stored.insert(r.id.clone(), r.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<u64> {
        let mut stored = self.write()?;
        Ok(ids.iter().filter(|id| stored.remove(*id).is_some()).count() as u64)
    }

    async fn delete_by_collection(&self, collection_name: &str) -> Result<u64> {
        let mut stored = self.write()?;
        let before = stored.len();
        stored.retain(|_, r| r.collection_name != collection_name);
        Ok((before - stored.len()) as u64)
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let stored = self.read()?;
        Ok(ids
            .iter()
            .filter(|id| stored.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let stored = self.read()?;
        Ok(ids.iter().filter_map(|id| stored.get(id).cloned()).collect())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &MetadataFilter,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let stored = self.read()?;
        let hits: Vec<ScoredRecord> = stored
            .values()
            .filter(|r| r.vector.len() == vector.len() && filter.matches(r))
            .filter_map(|r| {
                let score = cosine_similarity(vector, &r.vector);
                (score >= threshold).then(|| ScoredRecord {
                    record: r.clone(),
                    score,
                })
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn count(&self, filter: &MetadataFilter) -> Result<u64> {
        let stored = self.read()?;
        Ok(stored.values().filter(|r| filter.matches(r)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkType;

    fn rec(id: &str, collection: &str, chunk_type: ChunkType, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            collection_name: collection.into(),
            file_path: "f.md".into(),
            chunk_index: 0,
            chunk_type,
            text: id.into(),
            content_hash: String::new(),
            header_path: vec![],
            line_start: 1,
            line_end: 1,
            overlap_source: vec![],
            vector,
        }
    }

    #[tokio::test]
    async fn test_filter_applied_before_top_k() {
        let index = InMemoryVectorIndex::new();
        // The closest vectors belong to another collection
        index
            .upsert(&[
                rec("x1", "other", ChunkType::Text, vec![1.0, 0.0]),
                rec("x2", "other", ChunkType::Text, vec![1.0, 0.01]),
                rec("d1", "docs", ChunkType::Text, vec![0.5, 0.5]),
                rec("d2", "docs", ChunkType::Code, vec![0.2, 0.8]),
            ])
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::collection("docs"), 2, -1.0)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);

        let code = MetadataFilter {
            collection_name: Some("docs".into()),
            chunk_types: vec![ChunkType::Code],
        };
        let hits = index.query(&[1.0, 0.0], &code, 5, -1.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "d2");
    }

    #[tokio::test]
    async fn test_threshold_drops_low_scores() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(&[
                rec("a", "docs", ChunkType::Text, vec![1.0, 0.0]),
                rec("b", "docs", ChunkType::Text, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::default(), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "a");
    }

    #[tokio::test]
    async fn test_delete_and_existing() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(&[
                rec("a", "docs", ChunkType::Text, vec![1.0]),
                rec("b", "docs", ChunkType::Text, vec![1.0]),
                rec("c", "other", ChunkType::Text, vec![1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete(&["a".into(), "zzz".into()]).await.unwrap(), 1);
        let present = index
            .existing_ids(&["a".into(), "b".into()])
            .await
            .unwrap();
        assert!(present.contains("b") && !present.contains("a"));

        assert_eq!(index.delete_by_collection("docs").await.unwrap(), 1);
        assert_eq!(index.len(), 1);
    }
}
