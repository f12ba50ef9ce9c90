//! Status, collection and drift reports for the CLI.
//!
//! Everything printed here comes from the metadata store (plus a live count
//! from the vector index for `status`), so the output reflects what a
//! restarted process would see.

use anyhow::Result;
use serde_json::json;

use crate::engine::SyncEngine;
use crate::models::{SyncState, SyncStatus};

/// `csync status <name>`
pub async fn run_status(engine: &SyncEngine, collection: &str, json: bool) -> Result<()> {
    let status = engine.get_sync_status(collection).await?;
    let indexed = engine.index().count_collection(collection).await?;

    if json {
        let mut value = serde_json::to_value(&status)?;
        value["indexed_vectors"] = json!(indexed);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Collection:  {}", status.collection_name);
    println!("Status:      {}", status.status);
    println!("Last sync:   {}", format_opt_ts(status.last_sync_at));
    println!("Last try:    {}", format_opt_ts(status.last_sync_attempt_at));
    println!("Files:       {}", status.file_count);
    println!(
        "Vectors:     {} (index holds {})",
        status.vector_count, indexed
    );
    if status.changed_files_count > 0 {
        println!("Pending:     {} files", status.changed_files_count);
    }
    if let Some(err) = &status.error_message {
        println!("Error:       {}", err);
    }
    Ok(())
}

/// `csync collections`
pub async fn run_collections(engine: &SyncEngine, json: bool) -> Result<()> {
    let collections = engine.list_collections().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&collections)?);
        return Ok(());
    }
    if collections.is_empty() {
        println!("No collections.");
        return Ok(());
    }

    println!(
        "{:<24} {:<13} {:>6} {:>8}   LAST SYNC",
        "COLLECTION", "STATUS", "FILES", "VECTORS"
    );
    println!("{}", "-".repeat(72));
    for c in &collections {
        let state = if c.syncing {
            SyncState::InProgress
        } else {
            c.status.status
        };
        println!(
            "{:<24} {:<13} {:>6} {:>8}   {}",
            c.info.name,
            state.as_str(),
            c.status.file_count,
            c.status.vector_count,
            format_opt_ts(c.status.last_sync_at)
        );
    }
    Ok(())
}

/// `csync drift <name>`
pub async fn run_drift(engine: &SyncEngine, collection: &str, limit: i64, json: bool) -> Result<()> {
    let entries = engine.reconciliation_log(collection, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No drift recorded for {}.", collection);
        return Ok(());
    }

    for e in &entries {
        print!(
            "{}  {:<16} {}",
            format_ts_iso(e.detected_at),
            e.kind.as_str(),
            e.file_path
        );
        match &e.detail {
            Some(d) => println!("  ({})", d),
            None => println!(),
        }
    }
    Ok(())
}

/// One-line summary printed after `csync sync`.
pub fn print_sync_summary(status: &SyncStatus, processed: u64, failed: u64, skipped: u64) {
    println!("sync {}", status.collection_name);
    println!("  status: {}", status.status);
    println!("  files processed: {}", processed);
    if failed > 0 {
        println!("  files failed: {}", failed);
    }
    if skipped > 0 {
        println!("  files skipped: {}", skipped);
    }
    println!("  files: {}", status.file_count);
    println!("  vectors: {}", status.vector_count);
    if let Some(err) = &status.error_message {
        println!("  error: {}", err);
    }
}

fn format_opt_ts(ts: Option<i64>) -> String {
    match ts {
        Some(ms) => format_ts_relative(ms),
        None => "never".to_string(),
    }
}

/// Millisecond timestamp as a relative time ("3 hours ago").
fn format_ts_relative(ms: i64) -> String {
    let delta = (chrono::Utc::now().timestamp_millis() - ms) / 1000;

    if delta < 0 {
        return format_ts_iso(ms);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ms)
    }
}

fn format_ts_iso(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_timestamps() {
        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 2 * 3_600_000), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86_400_000 - 1000), "1 day ago");
        assert_eq!(format_opt_ts(None), "never");
    }

    #[test]
    fn test_iso_format() {
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
