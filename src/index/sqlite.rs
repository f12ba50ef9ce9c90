//! SQLite-backed [`VectorIndex`].
//!
//! Lives in its own database file so it can be dropped or rebuilt without
//! touching sync metadata. Embeddings are stored as little-endian f32 BLOBs;
//! queries pre-filter rows in SQL on collection and chunk type, then score
//! the survivors with cosine similarity in Rust.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Result, SyncError};
use crate::models::ChunkType;

use super::{rank, MetadataFilter, ScoredRecord, VectorIndex, VectorRecord};

/// Max bound parameters per `IN (...)` list.
const ID_BATCH: usize = 500;

const SELECT_COLUMNS: &str = "id, collection_name, file_path, chunk_index, chunk_type, text, \
     content_hash, header_path_json, line_start, line_end, overlap_json, embedding";

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

fn index_err(e: sqlx::Error) -> SyncError {
    SyncError::VectorIndex(e.to_string())
}

impl SqliteVectorIndex {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                collection_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_type TEXT NOT NULL,
                text TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                header_path_json TEXT NOT NULL DEFAULT '[]',
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                overlap_json TEXT NOT NULL DEFAULT '[]',
                dims INTEGER NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_vectors_collection ON vectors(collection_name, chunk_type)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn record_from_row(row: &SqliteRow) -> Result<VectorRecord> {
    let chunk_type: String = row.try_get("chunk_type").map_err(index_err)?;
    let header_path_json: String = row.try_get("header_path_json").map_err(index_err)?;
    let overlap_json: String = row.try_get("overlap_json").map_err(index_err)?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(index_err)?;
    let line_start: i64 = row.try_get("line_start").map_err(index_err)?;
    let line_end: i64 = row.try_get("line_end").map_err(index_err)?;

    Ok(VectorRecord {
        id: row.try_get("id").map_err(index_err)?,
        collection_name: row.try_get("collection_name").map_err(index_err)?,
        file_path: row.try_get("file_path").map_err(index_err)?,
        chunk_index: row.try_get("chunk_index").map_err(index_err)?,
        chunk_type: ChunkType::parse(&chunk_type).ok_or_else(|| {
            SyncError::VectorIndex(format!("unknown chunk type '{}'", chunk_type))
        })?,
        text: row.try_get("text").map_err(index_err)?,
        content_hash: row.try_get("content_hash").map_err(index_err)?,
        header_path: serde_json::from_str(&header_path_json)?,
        line_start: line_start.max(0) as usize,
        line_end: line_end.max(0) as usize,
        overlap_source: serde_json::from_str(&overlap_json)?,
        vector: blob_to_vec(&blob),
    })
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(index_err)?;

        for r in records {
            sqlx::query(
                r#"
                INSERT INTO vectors (id, collection_name, file_path, chunk_index, chunk_type, text,
                    content_hash, header_path_json, line_start, line_end, overlap_json, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    collection_name = excluded.collection_name,
                    file_path = excluded.file_path,
                    chunk_index = excluded.chunk_index,
                    chunk_type = excluded.chunk_type,
                    text = excluded.text,
                    content_hash = excluded.content_hash,
                    header_path_json = excluded.header_path_json,
                    line_start = excluded.line_start,
                    line_end = excluded.line_end,
                    overlap_json = excluded.overlap_json,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&r.id)
            .bind(&r.collection_name)
            .bind(&r.file_path)
            .bind(r.chunk_index)
            .bind(r.chunk_type.as_str())
            .bind(&r.text)
            .bind(&r.content_hash)
            .bind(serde_json::to_string(&r.header_path)?)
            .bind(r.line_start as i64)
            .bind(r.line_end as i64)
            .bind(serde_json::to_string(&r.overlap_source)?)
            .bind(r.vector.len() as i64)
            .bind(vec_to_blob(&r.vector))
            .execute(&mut *tx)
            .await
            .map_err(index_err)?;
        }

        tx.commit().await.map_err(index_err)?;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<u64> {
        let mut removed = 0;
        for batch in ids.chunks(ID_BATCH) {
            let sql = format!("DELETE FROM vectors WHERE id IN ({})", placeholders(batch.len()));
            let mut q = sqlx::query(&sql);
            for id in batch {
                q = q.bind(id);
            }
            removed += q.execute(&self.pool).await.map_err(index_err)?.rows_affected();
        }
        Ok(removed)
    }

    async fn delete_by_collection(&self, collection_name: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM vectors WHERE collection_name = ?")
            .bind(collection_name)
            .execute(&self.pool)
            .await
            .map_err(index_err)?;
        Ok(res.rows_affected())
    }

    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut present = HashSet::new();
        for batch in ids.chunks(ID_BATCH) {
            let sql = format!("SELECT id FROM vectors WHERE id IN ({})", placeholders(batch.len()));
            let mut q = sqlx::query_scalar::<_, String>(&sql);
            for id in batch {
                q = q.bind(id);
            }
            present.extend(q.fetch_all(&self.pool).await.map_err(index_err)?);
        }
        Ok(present)
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for batch in ids.chunks(ID_BATCH) {
            let sql = format!(
                "SELECT {} FROM vectors WHERE id IN ({})",
                SELECT_COLUMNS,
                placeholders(batch.len())
            );
            let mut q = sqlx::query(&sql);
            for id in batch {
                q = q.bind(id);
            }
            let rows = q.fetch_all(&self.pool).await.map_err(index_err)?;
            for row in &rows {
                out.push(record_from_row(row)?);
            }
        }
        // Preserve the caller's id order
        out.sort_by_key(|r| ids.iter().position(|id| id == &r.id).unwrap_or(usize::MAX));
        Ok(out)
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &MetadataFilter,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let mut sql = format!(
            "SELECT {} FROM vectors WHERE dims = ?",
            SELECT_COLUMNS
        );
        if filter.collection_name.is_some() {
            sql.push_str(" AND collection_name = ?");
        }
        if !filter.chunk_types.is_empty() {
            sql.push_str(&format!(
                " AND chunk_type IN ({})",
                placeholders(filter.chunk_types.len())
            ));
        }

        let mut q = sqlx::query(&sql).bind(vector.len() as i64);
        if let Some(c) = &filter.collection_name {
            q = q.bind(c);
        }
        for t in &filter.chunk_types {
            q = q.bind(t.as_str());
        }

        let rows = q.fetch_all(&self.pool).await.map_err(index_err)?;
        let mut hits = Vec::new();
        for row in &rows {
            let record = record_from_row(row)?;
            let score = cosine_similarity(vector, &record.vector);
            if score >= threshold {
                hits.push(ScoredRecord { record, score });
            }
        }
        Ok(rank(hits, k))
    }

    async fn count(&self, filter: &MetadataFilter) -> Result<u64> {
        let mut sql = "SELECT COUNT(*) FROM vectors WHERE 1 = 1".to_string();
        if filter.collection_name.is_some() {
            sql.push_str(" AND collection_name = ?");
        }
        if !filter.chunk_types.is_empty() {
            sql.push_str(&format!(
                " AND chunk_type IN ({})",
                placeholders(filter.chunk_types.len())
            ));
        }
        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(c) = &filter.collection_name {
            q = q.bind(c);
        }
        for t in &filter.chunk_types {
            q = q.bind(t.as_str());
        }
        let n = q.fetch_one(&self.pool).await.map_err(index_err)?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rec(id: &str, collection: &str, chunk_type: ChunkType, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            collection_name: collection.into(),
            file_path: "f.md".into(),
            chunk_index: 3,
            chunk_type,
            text: format!("text of {}", id),
            content_hash: "h".into(),
            header_path: vec!["Guide".into(), "Install".into()],
            line_start: 4,
            line_end: 9,
            overlap_source: vec!["other".into()],
            vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_get_roundtrip_metadata() {
        let tmp = TempDir::new().unwrap();
        let index = SqliteVectorIndex::open(&tmp.path().join("v.sqlite"))
            .await
            .unwrap();
        let r = rec("a", "docs", ChunkType::Table, vec![0.25, -1.5]);
        index.upsert(&[r.clone()]).await.unwrap();

        let got = index.get(&["a".into()]).await.unwrap();
        assert_eq!(got, vec![r]);
    }

    #[tokio::test]
    async fn test_query_filters_in_sql() {
        let tmp = TempDir::new().unwrap();
        let index = SqliteVectorIndex::open(&tmp.path().join("v.sqlite"))
            .await
            .unwrap();
        index
            .upsert(&[
                rec("x", "other", ChunkType::Text, vec![1.0, 0.0]),
                rec("d1", "docs", ChunkType::Text, vec![0.6, 0.8]),
                rec("d2", "docs", ChunkType::Code, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .query(&[1.0, 0.0], &MetadataFilter::collection("docs"), 1, -1.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "d1");
        assert!((hits[0].score - 0.6).abs() < 1e-5);

        let code = MetadataFilter {
            collection_name: Some("docs".into()),
            chunk_types: vec![ChunkType::Code],
        };
        assert_eq!(index.count(&code).await.unwrap(), 1);
        assert_eq!(index.count(&MetadataFilter::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_by_ids_and_collection() {
        let tmp = TempDir::new().unwrap();
        let index = SqliteVectorIndex::open(&tmp.path().join("v.sqlite"))
            .await
            .unwrap();
        index
            .upsert(&[
                rec("a", "docs", ChunkType::Text, vec![1.0]),
                rec("b", "docs", ChunkType::Text, vec![1.0]),
                rec("c", "other", ChunkType::Text, vec![1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete(&["a".into()]).await.unwrap(), 1);
        let present = index
            .existing_ids(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(present.len(), 2);
        assert_eq!(index.delete_by_collection("docs").await.unwrap(), 1);
        assert_eq!(index.count(&MetadataFilter::default()).await.unwrap(), 1);
    }
}
