//! Durable metadata store: collections, sync status, file→vector mappings,
//! and the reconciliation log.
//!
//! Backed by SQLite via `sqlx`. Every per-file commit runs in a single
//! transaction that writes the mapping and refreshes the collection's
//! aggregate counts together, so a crash never leaves counts that disagree
//! with the mappings table.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;

use crate::db;
use crate::error::{Result, SyncError};
use crate::migrate;
use crate::models::{
    now_millis, CollectionInfo, DriftEntry, DriftKind, FileVectorMapping, SyncState, SyncStatus,
};

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Collections ============

    /// Insert the collection row if absent; refresh its description otherwise.
    pub async fn ensure_collection(&self, info: &CollectionInfo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collections (name, description, created_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET description = excluded.description
            "#,
        )
        .bind(&info.name)
        .bind(&info.description)
        .bind(info.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every row belonging to a collection. Returns false if unknown.
    pub async fn forget_collection(&self, name: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    // ============ Sync status ============

    pub async fn get_status(&self, name: &str) -> Result<Option<SyncStatus>> {
        let row = sqlx::query(
            r#"
            SELECT collection_name, status, last_sync_at, last_sync_attempt_at, vector_count,
                   file_count, changed_files_count, error_message, strategy_fingerprint
            FROM sync_status WHERE collection_name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(status_from_row).transpose()
    }

    /// Status row, or the `never_synced` default when none exists.
    pub async fn status_or_default(&self, name: &str) -> Result<SyncStatus> {
        Ok(self
            .get_status(name)
            .await?
            .unwrap_or_else(|| SyncStatus::never_synced(name)))
    }

    /// Overwrite the status row with `status`.
    pub async fn put_status(&self, status: &SyncStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (collection_name, status, last_sync_at, last_sync_attempt_at,
                vector_count, file_count, changed_files_count, error_message, strategy_fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection_name) DO UPDATE SET
                status = excluded.status,
                last_sync_at = excluded.last_sync_at,
                last_sync_attempt_at = excluded.last_sync_attempt_at,
                vector_count = excluded.vector_count,
                file_count = excluded.file_count,
                changed_files_count = excluded.changed_files_count,
                error_message = excluded.error_message,
                strategy_fingerprint = excluded.strategy_fingerprint
            "#,
        )
        .bind(&status.collection_name)
        .bind(status.status.as_str())
        .bind(status.last_sync_at)
        .bind(status.last_sync_attempt_at)
        .bind(status.vector_count)
        .bind(status.file_count)
        .bind(status.changed_files_count)
        .bind(&status.error_message)
        .bind(&status.strategy_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a pass as started. Returns the status as it was before, so a
    /// pass that fails before committing anything can put it back.
    pub async fn begin_sync(&self, name: &str, attempt_at: i64) -> Result<SyncStatus> {
        let previous = self.status_or_default(name).await?;
        let mut next = previous.clone();
        next.status = SyncState::InProgress;
        next.last_sync_attempt_at = Some(attempt_at);
        next.error_message = None;
        self.put_status(&next).await?;
        self.heartbeat(name, attempt_at).await?;
        Ok(previous)
    }

    /// Record that the pass running for `name` is still alive.
    pub async fn heartbeat(&self, name: &str, at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sync_status SET heartbeat_at = ? WHERE collection_name = ? AND status = 'in_progress'",
        )
            .bind(at)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Demote `in_progress` rows whose pass stopped heartbeating before
    /// `stale_before`. Rows of passes still running in another process
    /// keep their heartbeat fresh and are left alone.
    pub async fn mark_interrupted(&self, stale_before: i64) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE sync_status
            SET status = 'partial', error_message = 'sync interrupted by shutdown'
            WHERE status = 'in_progress' AND COALESCE(heartbeat_at, 0) < ?
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn set_changed_files_count(&self, name: &str, count: i64) -> Result<()> {
        sqlx::query("UPDATE sync_status SET changed_files_count = ? WHERE collection_name = ?")
            .bind(count)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the terminal state of a pass and recompute aggregate counts.
    ///
    /// `last_sync_at` advances for `completed` and `partial`; the strategy
    /// fingerprint is only replaced when `fingerprint` is `Some`.
    pub async fn finish_sync(
        &self,
        name: &str,
        state: SyncState,
        changed_files_count: i64,
        error_message: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<SyncStatus> {
        let advance = matches!(state, SyncState::Completed | SyncState::Partial);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE sync_status SET
                status = ?,
                last_sync_at = CASE WHEN ? THEN ? ELSE last_sync_at END,
                changed_files_count = ?,
                error_message = ?,
                strategy_fingerprint = COALESCE(?, strategy_fingerprint),
                heartbeat_at = NULL
            WHERE collection_name = ?
            "#,
        )
        .bind(state.as_str())
        .bind(advance)
        .bind(now_millis())
        .bind(changed_files_count)
        .bind(error_message)
        .bind(fingerprint)
        .bind(name)
        .execute(&mut *tx)
        .await?;

        refresh_aggregates(&mut tx, name).await?;
        tx.commit().await?;

        self.status_or_default(name).await
    }

    /// Put back a status captured by [`begin_sync`](Self::begin_sync),
    /// keeping only the new attempt timestamp.
    pub async fn restore_status(&self, previous: &SyncStatus, attempt_at: i64) -> Result<()> {
        let mut restored = previous.clone();
        restored.last_sync_attempt_at = Some(attempt_at);
        self.put_status(&restored).await
    }

    /// `(file_count, vector_count)` derived from the mappings table.
    pub async fn aggregates(&self, name: &str) -> Result<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS files, COALESCE(SUM(chunk_count), 0) AS vectors
            FROM file_vector_mappings WHERE collection_name = ?
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("files")?, row.try_get("vectors")?))
    }

    // ============ Mappings ============

    pub async fn list_mappings(&self, name: &str) -> Result<Vec<FileVectorMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT collection_name, file_path, file_hash_at_sync, chunk_ids_json, chunk_count,
                   last_synced_at, processing_time_ms, strategy_fingerprint
            FROM file_vector_mappings WHERE collection_name = ? ORDER BY file_path
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mapping_from_row).collect()
    }

    pub async fn get_mapping(&self, name: &str, file_path: &str) -> Result<Option<FileVectorMapping>> {
        let row = sqlx::query(
            r#"
            SELECT collection_name, file_path, file_hash_at_sync, chunk_ids_json, chunk_count,
                   last_synced_at, processing_time_ms, strategy_fingerprint
            FROM file_vector_mappings WHERE collection_name = ? AND file_path = ?
            "#,
        )
        .bind(name)
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    /// Write one file's mapping and refresh the collection aggregates in a
    /// single transaction.
    pub async fn commit_mapping(&self, mapping: &FileVectorMapping) -> Result<()> {
        let chunk_ids_json = serde_json::to_string(&mapping.chunk_ids)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO file_vector_mappings (collection_name, file_path, file_hash_at_sync,
                chunk_ids_json, chunk_count, last_synced_at, processing_time_ms,
                strategy_fingerprint)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection_name, file_path) DO UPDATE SET
                file_hash_at_sync = excluded.file_hash_at_sync,
                chunk_ids_json = excluded.chunk_ids_json,
                chunk_count = excluded.chunk_count,
                last_synced_at = excluded.last_synced_at,
                processing_time_ms = excluded.processing_time_ms,
                strategy_fingerprint = excluded.strategy_fingerprint
            "#,
        )
        .bind(&mapping.collection_name)
        .bind(&mapping.file_path)
        .bind(&mapping.file_hash_at_sync)
        .bind(&chunk_ids_json)
        .bind(mapping.chunk_count)
        .bind(mapping.last_synced_at)
        .bind(mapping.processing_time_ms)
        .bind(&mapping.strategy_fingerprint)
        .execute(&mut *tx)
        .await?;

        refresh_aggregates(&mut tx, &mapping.collection_name).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove one file's mapping. Returns false if there was none.
    pub async fn remove_mapping(&self, name: &str, file_path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            "DELETE FROM file_vector_mappings WHERE collection_name = ? AND file_path = ?",
        )
        .bind(name)
        .bind(file_path)
        .execute(&mut *tx)
        .await?;
        refresh_aggregates(&mut tx, name).await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }

    /// Remove every mapping of a collection. Returns the number removed.
    pub async fn delete_all_mappings(&self, name: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query("DELETE FROM file_vector_mappings WHERE collection_name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        refresh_aggregates(&mut tx, name).await?;
        tx.commit().await?;
        Ok(res.rows_affected())
    }

    // ============ Reconciliation log ============

    pub async fn log_drift(
        &self,
        name: &str,
        file_path: &str,
        kind: DriftKind,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_log (collection_name, file_path, kind, detail, detected_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(file_path)
        .bind(kind.as_str())
        .bind(detail)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent drift entries first.
    pub async fn list_drift(&self, name: &str, limit: i64) -> Result<Vec<DriftEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, collection_name, file_path, kind, detail, detected_at
            FROM reconciliation_log WHERE collection_name = ?
            ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let kind: String = r.try_get("kind")?;
                Ok(DriftEntry {
                    id: r.try_get("id")?,
                    collection_name: r.try_get("collection_name")?,
                    file_path: r.try_get("file_path")?,
                    kind: DriftKind::parse(&kind).ok_or_else(|| {
                        SyncError::Validation(format!("unknown drift kind '{}'", kind))
                    })?,
                    detail: r.try_get("detail")?,
                    detected_at: r.try_get("detected_at")?,
                })
            })
            .collect()
    }
}

async fn refresh_aggregates(tx: &mut Transaction<'_, Sqlite>, name: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sync_status SET
            file_count = (SELECT COUNT(*) FROM file_vector_mappings WHERE collection_name = ?),
            vector_count = (SELECT COALESCE(SUM(chunk_count), 0) FROM file_vector_mappings WHERE collection_name = ?)
        WHERE collection_name = ?
        "#,
    )
    .bind(name)
    .bind(name)
    .bind(name)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn status_from_row(row: &SqliteRow) -> Result<SyncStatus> {
    let status: String = row.try_get("status")?;
    Ok(SyncStatus {
        collection_name: row.try_get("collection_name")?,
        status: SyncState::parse(&status)
            .ok_or_else(|| SyncError::Validation(format!("unknown sync status '{}'", status)))?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_sync_attempt_at: row.try_get("last_sync_attempt_at")?,
        vector_count: row.try_get("vector_count")?,
        file_count: row.try_get("file_count")?,
        changed_files_count: row.try_get("changed_files_count")?,
        error_message: row.try_get("error_message")?,
        strategy_fingerprint: row.try_get("strategy_fingerprint")?,
    })
}

fn mapping_from_row(row: &SqliteRow) -> Result<FileVectorMapping> {
    let chunk_ids_json: String = row.try_get("chunk_ids_json")?;
    Ok(FileVectorMapping {
        collection_name: row.try_get("collection_name")?,
        file_path: row.try_get("file_path")?,
        file_hash_at_sync: row.try_get("file_hash_at_sync")?,
        chunk_ids: serde_json::from_str(&chunk_ids_json)?,
        chunk_count: row.try_get("chunk_count")?,
        last_synced_at: row.try_get("last_synced_at")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        strategy_fingerprint: row.try_get("strategy_fingerprint")?,
    })
}
