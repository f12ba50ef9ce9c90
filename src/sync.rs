//! One incremental sync pass over a single collection.
//!
//! A pass lists the collection's files, diffs them against the stored
//! mappings, and for every added or modified file runs
//! chunk → embed → upsert → commit mapping → drop stale chunks. Deleted
//! files have their vectors removed before their mapping. Each file is
//! committed on its own, so a failure or cancellation keeps everything
//! already committed and the next pass resumes from there.
//!
//! Locking, admission control and run ids are the caller's job; see
//! [`SyncEngine`](crate::engine::SyncEngine).

use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::change;
use crate::chunk::{self, ChunkingStrategy, FileRef};
use crate::embedding::{embed_checked, EmbeddingProvider};
use crate::error::{Result, SyncError};
use crate::index::VectorIndexAdapter;
use crate::metadata::MetadataStore;
use crate::models::{
    now_millis, Chunk, DriftKind, FileFailure, FileSnapshot, FileVectorMapping, SyncOutcome,
    SyncState, SyncStatus,
};
use crate::provider::FileCollectionProvider;
use crate::retry::{retry, RetryPolicy};

/// Progress notifications published while a pass runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        collection: String,
        run_id: String,
        /// Files that need work in this pass.
        total: u64,
    },
    FileSynced {
        collection: String,
        run_id: String,
        file_path: String,
        chunks: u64,
        done: u64,
        total: u64,
    },
    FileDeleted {
        collection: String,
        run_id: String,
        file_path: String,
        done: u64,
        total: u64,
    },
    FileFailed {
        collection: String,
        run_id: String,
        file_path: String,
        error: String,
        done: u64,
        total: u64,
    },
    Finished {
        collection: String,
        run_id: String,
        outcome: SyncState,
        files_processed: u64,
        files_failed: u64,
        files_skipped: u64,
        /// Status row as committed at the end of the pass.
        status: SyncStatus,
    },
}

/// Tunables for a pass, resolved from configuration.
#[derive(Debug, Clone)]
pub struct PassSettings {
    pub strategy: ChunkingStrategy,
    pub retry: RetryPolicy,
    /// Texts per embedding request.
    pub batch_size: usize,
    /// Embedding requests in flight per file.
    pub fan_out: usize,
    /// Check unchanged files for vectors missing from the index.
    pub verify_index: bool,
}

enum FileWork {
    Upsert {
        file: FileSnapshot,
        previous: Option<FileVectorMapping>,
    },
    Delete(FileVectorMapping),
}

impl FileWork {
    fn path(&self) -> &str {
        match self {
            FileWork::Upsert { file, .. } => &file.path,
            FileWork::Delete(m) => &m.file_path,
        }
    }
}

struct Plan {
    work: Vec<FileWork>,
    force_full: bool,
}

pub struct SyncOrchestrator {
    provider: Arc<dyn FileCollectionProvider>,
    store: MetadataStore,
    index: VectorIndexAdapter,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: PassSettings,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn new(
        provider: Arc<dyn FileCollectionProvider>,
        store: MetadataStore,
        index: VectorIndexAdapter,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: PassSettings,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            provider,
            store,
            index,
            embedder,
            settings,
            events,
        }
    }

    /// Identifies everything that shapes stored vectors: the chunking
    /// parameters plus the embedding model. A mismatch with the value
    /// stored by the last completed pass forces a full resync.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}:{}",
            self.settings.strategy.fingerprint(),
            self.embedder.model_name(),
            self.embedder.dims()
        )
    }

    /// Run one pass. The caller must hold the collection's sync lock.
    ///
    /// Errors are returned only when the pass fails before committing any
    /// file; the previous status is restored in that case. Per-file
    /// failures are reported in the outcome.
    pub async fn run_pass(
        &self,
        collection: &str,
        force_full: bool,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let info = self
            .provider
            .get_collection(collection)
            .await?
            .ok_or_else(|| SyncError::CollectionNotFound(collection.to_string()))?;
        self.store.ensure_collection(&info).await?;

        let attempt_at = now_millis();
        let previous = self.store.begin_sync(collection, attempt_at).await?;
        info!(collection, run_id, force_full, "sync pass started");

        let fingerprint = self.fingerprint();
        let plan = match self
            .plan(collection, force_full, &fingerprint)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                error!(collection, run_id, error = %e, "sync pass failed before any commit");
                self.store.restore_status(&previous, attempt_at).await?;
                return Err(e);
            }
        };

        let total = plan.work.len() as u64;
        self.emit(SyncEvent::Started {
            collection: collection.to_string(),
            run_id: run_id.to_string(),
            total,
        });

        let mut outcome = SyncOutcome {
            collection_name: collection.to_string(),
            run_id: run_id.to_string(),
            status: SyncState::Completed,
            files_processed: 0,
            files_failed: 0,
            files_skipped: 0,
            chunks_written: 0,
            failures: Vec::new(),
        };

        for (i, work) in plan.work.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.files_skipped = total - i as u64;
                warn!(
                    collection,
                    run_id,
                    skipped = outcome.files_skipped,
                    "sync pass cancelled"
                );
                break;
            }

            let path = work.path().to_string();
            let done = i as u64 + 1;
            let result = match work {
                FileWork::Upsert { file, previous } => {
                    self.sync_file(file, previous.as_ref(), plan.force_full).await
                }
                FileWork::Delete(mapping) => self.remove_file(mapping).await.map(|_| 0),
            };

            match result {
                Ok(chunks) => {
                    outcome.files_processed += 1;
                    outcome.chunks_written += chunks;
                    let event = match work {
                        FileWork::Upsert { .. } => SyncEvent::FileSynced {
                            collection: collection.to_string(),
                            run_id: run_id.to_string(),
                            file_path: path,
                            chunks,
                            done,
                            total,
                        },
                        FileWork::Delete(_) => SyncEvent::FileDeleted {
                            collection: collection.to_string(),
                            run_id: run_id.to_string(),
                            file_path: path,
                            done,
                            total,
                        },
                    };
                    self.emit(event);
                }
                Err(e) => {
                    warn!(collection, run_id, file = %path, error = %e, "file sync failed");
                    outcome.files_failed += 1;
                    outcome.failures.push(FileFailure {
                        file_path: path.clone(),
                        error: e.to_string(),
                    });
                    self.emit(SyncEvent::FileFailed {
                        collection: collection.to_string(),
                        run_id: run_id.to_string(),
                        file_path: path,
                        error: e.to_string(),
                        done,
                        total,
                    });
                }
            }
        }

        outcome.status = terminal_state(&outcome);
        let message = failure_message(&outcome, total);
        let outstanding = (outcome.files_failed + outcome.files_skipped) as i64;
        let committed_fingerprint = matches!(outcome.status, SyncState::Completed | SyncState::Partial)
            .then_some(fingerprint);

        let status = self
            .store
            .finish_sync(
                collection,
                outcome.status,
                outstanding,
                message.as_deref(),
                committed_fingerprint.as_deref(),
            )
            .await?;

        info!(
            collection,
            run_id,
            status = %outcome.status,
            processed = outcome.files_processed,
            failed = outcome.files_failed,
            skipped = outcome.files_skipped,
            chunks = outcome.chunks_written,
            "sync pass finished"
        );
        self.emit(SyncEvent::Finished {
            collection: collection.to_string(),
            run_id: run_id.to_string(),
            outcome: outcome.status,
            files_processed: outcome.files_processed,
            files_failed: outcome.files_failed,
            files_skipped: outcome.files_skipped,
            status,
        });

        Ok(outcome)
    }

    /// Everything up to the first commit: listing, diffing, verification
    /// and drift logging.
    async fn plan(
        &self,
        collection: &str,
        force_full: bool,
        fingerprint: &str,
    ) -> Result<Plan> {
        let files = self.provider.list_files(collection).await?;
        let mappings = self.store.list_mappings(collection).await?;

        let outdated = mappings
            .iter()
            .filter(|m| m.strategy_fingerprint != fingerprint)
            .count();
        if outdated > 0 {
            info!(
                collection,
                files = outdated,
                "chunking strategy or embedding model changed, resyncing affected files"
            );
        }
        let mut changes = change::diff(&files, &mappings, force_full, fingerprint);

        let mut missing_vectors = HashSet::new();
        if self.settings.verify_index && !force_full {
            for m in &mappings {
                if changes.contains(&m.file_path) {
                    continue;
                }
                match self.index.verify_mapping(m).await {
                    Ok(()) => {}
                    Err(SyncError::CorruptMapping { missing, .. }) => {
                        warn!(
                            collection,
                            file = %m.file_path,
                            missing,
                            "mapped vectors missing from index"
                        );
                        let detail =
                            format!("{} of {} chunks missing", missing, m.chunk_ids.len());
                        self.store
                            .log_drift(
                                collection,
                                &m.file_path,
                                DriftKind::MissingVectors,
                                Some(&detail),
                            )
                            .await?;
                        changes.mark_modified(&m.file_path);
                        missing_vectors.insert(m.file_path.clone());
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut by_path: HashMap<String, FileVectorMapping> = mappings
            .into_iter()
            .map(|m| (m.file_path.clone(), m))
            .collect();
        let mut snapshots: HashMap<String, FileSnapshot> =
            files.into_iter().map(|f| (f.path.clone(), f)).collect();

        let mut work = Vec::with_capacity(changes.len());
        for path in &changes.added {
            self.store
                .log_drift(collection, path, DriftKind::Added, None)
                .await?;
            if let Some(file) = snapshots.remove(path) {
                work.push(FileWork::Upsert {
                    file,
                    previous: None,
                });
            }
        }
        for path in &changes.modified {
            let previous = by_path.remove(path);
            let Some(file) = snapshots.remove(path) else {
                continue;
            };
            let hash_changed = previous
                .as_ref()
                .is_some_and(|m| m.file_hash_at_sync != file.content_hash);
            if hash_changed && !missing_vectors.contains(path) {
                self.store
                    .log_drift(collection, path, DriftKind::Modified, None)
                    .await?;
            }
            work.push(FileWork::Upsert { file, previous });
        }
        for path in &changes.deleted {
            if let Some(mapping) = by_path.remove(path) {
                self.store
                    .log_drift(collection, path, DriftKind::Deleted, None)
                    .await?;
                work.push(FileWork::Delete(mapping));
            }
        }

        debug!(
            collection,
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "change set computed"
        );
        self.store
            .set_changed_files_count(collection, work.len() as i64)
            .await?;

        Ok(Plan { work, force_full })
    }

    /// Bring one file's vectors up to date. Returns the chunk count.
    async fn sync_file(
        &self,
        file: &FileSnapshot,
        previous: Option<&FileVectorMapping>,
        reembed_all: bool,
    ) -> Result<u64> {
        let started = Instant::now();
        let fingerprint = self.fingerprint();
        // Vectors built under another strategy or model are never reused
        let reembed_all =
            reembed_all || previous.is_some_and(|m| m.strategy_fingerprint != fingerprint);
        let chunks = chunk::chunk(
            &file.content,
            FileRef {
                collection_name: &file.collection_name,
                file_path: &file.path,
            },
            &self.settings.strategy,
        );
        let new_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let old_ids: HashSet<&str> = previous
            .map(|m| m.chunk_ids.iter().map(String::as_str).collect())
            .unwrap_or_default();

        // Ids are content-addressed, so a surviving id still has a valid vector
        let mut reusable: HashMap<String, Vec<f32>> = HashMap::new();
        if !reembed_all {
            let candidates: Vec<String> = new_ids
                .iter()
                .filter(|id| old_ids.contains(id.as_str()))
                .cloned()
                .collect();
            if !candidates.is_empty() {
                let dims = self.embedder.dims();
                reusable = retry(&self.settings.retry, "index.get", || {
                    self.index.get_chunks(&candidates)
                })
                .await?
                .into_iter()
                .filter(|r| r.vector.len() == dims)
                .map(|r| (r.id, r.vector))
                .collect();
            }
        }

        let to_embed: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| !reusable.contains_key(&c.id))
            .collect();
        let mut fresh = self.embed_chunks(&to_embed).await?.into_iter();

        let mut vectors = Vec::with_capacity(chunks.len());
        for c in &chunks {
            let vector = match reusable.remove(&c.id) {
                Some(v) => v,
                None => fresh.next().ok_or_else(|| {
                    SyncError::EmbeddingProvider(format!("no vector for chunk {}", c.id))
                })?,
            };
            vectors.push(vector);
        }

        let mapping = FileVectorMapping {
            collection_name: file.collection_name.clone(),
            file_path: file.path.clone(),
            file_hash_at_sync: file.content_hash.clone(),
            chunk_ids: new_ids.clone(),
            chunk_count: chunks.len() as i64,
            last_synced_at: now_millis(),
            processing_time_ms: started.elapsed().as_millis() as i64,
            strategy_fingerprint: fingerprint,
        };

        let committed = async {
            retry(&self.settings.retry, "index.upsert", || {
                self.index.upsert_chunks(&chunks, &vectors)
            })
            .await?;
            self.store.commit_mapping(&mapping).await
        }
        .await;

        if let Err(e) = committed {
            let added: Vec<String> = new_ids
                .iter()
                .filter(|id| !old_ids.contains(id.as_str()))
                .cloned()
                .collect();
            if let Err(cleanup) = self.index.delete_chunks(&added).await {
                warn!(file = %file.path, error = %cleanup, "failed to roll back uncommitted chunks");
            }
            return Err(e);
        }

        let new_set: HashSet<&str> = new_ids.iter().map(String::as_str).collect();
        let stale: Vec<String> = old_ids
            .iter()
            .filter(|id| !new_set.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !stale.is_empty() {
            let removed = retry(&self.settings.retry, "index.delete", || {
                self.index.delete_chunks(&stale)
            })
            .await;
            if let Err(e) = removed {
                warn!(file = %file.path, stale = stale.len(), error = %e, "stale chunks left in index");
                let detail = format!("{} stale chunks not removed: {}", stale.len(), e);
                if let Err(log_err) = self
                    .store
                    .log_drift(
                        &file.collection_name,
                        &file.path,
                        DriftKind::OrphanedVectors,
                        Some(&detail),
                    )
                    .await
                {
                    warn!(error = %log_err, "failed to record orphaned vectors");
                }
            }
        }

        debug!(
            file = %file.path,
            chunks = chunks.len(),
            embedded = to_embed.len(),
            elapsed_ms = mapping.processing_time_ms,
            "file synced"
        );
        Ok(chunks.len() as u64)
    }

    /// Drop a deleted file's vectors, then its mapping.
    async fn remove_file(&self, mapping: &FileVectorMapping) -> Result<()> {
        retry(&self.settings.retry, "index.delete", || {
            self.index.delete_chunks(&mapping.chunk_ids)
        })
        .await?;
        self.store
            .remove_mapping(&mapping.collection_name, &mapping.file_path)
            .await?;
        debug!(file = %mapping.file_path, "file removed");
        Ok(())
    }

    /// Embed in batches of `batch_size`, up to `fan_out` requests at once.
    async fn embed_chunks(&self, chunks: &[&Chunk]) -> Result<Vec<Vec<f32>>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedder = self.embedder.as_ref();
        let policy = &self.settings.retry;

        // Collected before streaming so the pass future stays Send
        let requests: Vec<_> = texts
            .chunks(self.settings.batch_size.max(1))
            .map(|batch| retry(policy, "embed", move || embed_checked(embedder, batch)))
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(requests)
            .buffered(self.settings.fan_out.max(1))
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn terminal_state(outcome: &SyncOutcome) -> SyncState {
    if outcome.files_failed > 0 && outcome.files_processed == 0 {
        SyncState::Error
    } else if outcome.files_failed > 0 || outcome.files_skipped > 0 {
        SyncState::Partial
    } else {
        SyncState::Completed
    }
}

fn failure_message(outcome: &SyncOutcome, total: u64) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(first) = outcome.failures.first() {
        parts.push(format!(
            "{} of {} files failed (first: {}: {})",
            outcome.files_failed, total, first.file_path, first.error
        ));
    }
    if outcome.files_skipped > 0 {
        parts.push(format!(
            "cancelled with {} files not processed",
            outcome.files_skipped
        ));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn require_send<T: Send>(_: T) {}

    // Compile-time check: passes are moved onto tokio worker threads.
    #[allow(dead_code)]
    fn run_pass_future_is_send(orchestrator: &SyncOrchestrator, cancel: &CancellationToken) {
        require_send(orchestrator.run_pass("docs", false, "run", cancel));
        require_send(orchestrator.embed_chunks(&[]));
    }

    fn outcome(processed: u64, failed: u64, skipped: u64) -> SyncOutcome {
        SyncOutcome {
            collection_name: "docs".into(),
            run_id: "r".into(),
            status: SyncState::InProgress,
            files_processed: processed,
            files_failed: failed,
            files_skipped: skipped,
            chunks_written: 0,
            failures: (0..failed)
                .map(|i| FileFailure {
                    file_path: format!("f{}.md", i),
                    error: "boom".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_terminal_state() {
        assert_eq!(terminal_state(&outcome(3, 0, 0)), SyncState::Completed);
        assert_eq!(terminal_state(&outcome(0, 0, 0)), SyncState::Completed);
        assert_eq!(terminal_state(&outcome(2, 1, 0)), SyncState::Partial);
        assert_eq!(terminal_state(&outcome(1, 0, 4)), SyncState::Partial);
        assert_eq!(terminal_state(&outcome(0, 0, 4)), SyncState::Partial);
        assert_eq!(terminal_state(&outcome(0, 2, 0)), SyncState::Error);
    }

    #[test]
    fn test_failure_message() {
        assert!(failure_message(&outcome(3, 0, 0), 3).is_none());

        let msg = failure_message(&outcome(1, 1, 2), 4).unwrap();
        assert!(msg.contains("1 of 4 files failed"));
        assert!(msg.contains("f0.md: boom"));
        assert!(msg.contains("2 files not processed"));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(SyncEvent::FileDeleted {
            collection: "docs".into(),
            run_id: "r1".into(),
            file_path: "a.md".into(),
            done: 1,
            total: 2,
        })
        .unwrap();
        assert_eq!(json["event"], "file_deleted");
        assert_eq!(json["file_path"], "a.md");
    }
}
