use sqlx::SqlitePool;

use crate::error::Result;

/// Create the metadata schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Collections known to the store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One status row per collection
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_status (
            collection_name TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            last_sync_at INTEGER,
            last_sync_attempt_at INTEGER,
            vector_count INTEGER NOT NULL DEFAULT 0,
            file_count INTEGER NOT NULL DEFAULT 0,
            changed_files_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            strategy_fingerprint TEXT,
            heartbeat_at INTEGER,
            FOREIGN KEY (collection_name) REFERENCES collections(name) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // File -> chunk id mappings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_vector_mappings (
            collection_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_hash_at_sync TEXT NOT NULL,
            chunk_ids_json TEXT NOT NULL DEFAULT '[]',
            chunk_count INTEGER NOT NULL DEFAULT 0,
            last_synced_at INTEGER NOT NULL,
            processing_time_ms INTEGER NOT NULL DEFAULT 0,
            strategy_fingerprint TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (collection_name, file_path),
            FOREIGN KEY (collection_name) REFERENCES collections(name) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only drift log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            detail TEXT,
            detected_at INTEGER NOT NULL,
            FOREIGN KEY (collection_name) REFERENCES collections(name) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the first release
    add_column_if_missing(pool, "sync_status", "heartbeat_at", "INTEGER").await?;
    add_column_if_missing(
        pool,
        "file_vector_mappings",
        "strategy_fingerprint",
        "TEXT NOT NULL DEFAULT ''",
    )
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_mappings_collection ON file_vector_mappings(collection_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_reconciliation_collection ON reconciliation_log(collection_name, detected_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let present: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    if present == 0 {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
        sqlx::query(&sql).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upgrades_tables_missing_new_columns() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("old.sqlite")).await.unwrap();
        sqlx::query(
            "CREATE TABLE file_vector_mappings (collection_name TEXT NOT NULL, file_path TEXT NOT NULL, \
             file_hash_at_sync TEXT NOT NULL, chunk_ids_json TEXT NOT NULL DEFAULT '[]', \
             chunk_count INTEGER NOT NULL DEFAULT 0, last_synced_at INTEGER NOT NULL, \
             processing_time_ms INTEGER NOT NULL DEFAULT 0, PRIMARY KEY (collection_name, file_path))",
        )
        .execute(&pool)
        .await
        .unwrap();

        run_migrations(&pool).await.unwrap();
        // Second run is a no-op
        run_migrations(&pool).await.unwrap();

        let cols: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('file_vector_mappings')")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert!(cols.iter().any(|c| c == "strategy_fingerprint"));
        let cols: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('sync_status')")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert!(cols.iter().any(|c| c == "heartbeat_at"));
    }
}
