//! Public entry point: [`SyncEngine`].
//!
//! The engine wires the file collection provider, metadata store, vector
//! index and embedding provider together and enforces the concurrency
//! model:
//!
//! - one pass per collection at a time (a second request fails fast with
//!   [`SyncError::ConcurrentSync`]),
//! - at most `sync.max_concurrent_syncs` passes across all collections,
//!   extra passes wait for a worker slot,
//! - searches never take a collection lock.
//!
//! The metadata store is the only source of truth for status; the engine
//! keeps nothing in memory that a restart would need.

use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{ActiveSync, CollectionHandle, SyncManagerCache};
use crate::config::{Config, SearchConfig, SyncConfig};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{Result, SyncError};
use crate::index::{InMemoryVectorIndex, SqliteVectorIndex, VectorIndex, VectorIndexAdapter};
use crate::metadata::MetadataStore;
use crate::models::{now_millis, CollectionInfo, DriftEntry, SyncOutcome, SyncState, SyncStatus};
use crate::provider::{validate_collection_name, FileCollectionProvider, FsCollectionProvider};
use crate::retry::RetryPolicy;
use crate::search::{self, SearchHit, SearchRequest};
use crate::sync::{PassSettings, SyncEvent, SyncOrchestrator};

/// How often a running pass refreshes its heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// An `in_progress` row whose heartbeat is older than this belongs to a
/// process that is gone.
const HEARTBEAT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub provider: Arc<dyn FileCollectionProvider>,
    pub store: MetadataStore,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pass: PassSettings,
    pub max_concurrent_syncs: usize,
    pub cache_capacity: usize,
    pub status_channel_capacity: usize,
    pub search: SearchConfig,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let strategy = config.chunking.resolve()?;
        Ok(Self {
            pass: PassSettings {
                strategy,
                retry: RetryPolicy::from_config(&config.sync),
                batch_size: config.embedding.batch_size,
                fan_out: config.embedding.fan_out,
                verify_index: config.sync.verify_index,
            },
            max_concurrent_syncs: config.sync.max_concurrent_syncs,
            cache_capacity: config.sync.cache_capacity,
            status_channel_capacity: config.sync.status_channel_capacity,
            search: config.search.clone(),
        })
    }

    /// Defaults for everything except the chunking strategy.
    pub fn with_strategy(strategy: crate::chunk::ChunkingStrategy) -> Self {
        let sync = SyncConfig::default();
        let embedding = crate::config::EmbeddingConfig::default();
        Self {
            pass: PassSettings {
                strategy,
                retry: RetryPolicy::from_config(&sync),
                batch_size: embedding.batch_size,
                fan_out: embedding.fan_out,
                verify_index: sync.verify_index,
            },
            max_concurrent_syncs: sync.max_concurrent_syncs,
            cache_capacity: sync.cache_capacity,
            status_channel_capacity: sync.status_channel_capacity,
            search: SearchConfig::default(),
        }
    }
}

/// A provider collection together with its stored sync status.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionOverview {
    #[serde(flatten)]
    pub info: CollectionInfo,
    pub status: SyncStatus,
    pub syncing: bool,
}

/// A pass running in the background.
pub struct SyncJob {
    pub collection_name: String,
    pub run_id: String,
    handle: JoinHandle<Result<SyncOutcome>>,
}

impl SyncJob {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the pass to finish.
    pub async fn wait(self) -> Result<SyncOutcome> {
        self.handle.await?
    }
}

/// Clears the handle's active pass on drop, before the lock is released.
struct ActiveGuard {
    handle: Arc<CollectionHandle>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.handle.clear_active();
    }
}

/// Everything a pass holds while it runs. Field order matters: the active
/// marker must be cleared before the lock is released.
struct Admission {
    collection: String,
    run_id: String,
    cancel: CancellationToken,
    _active: ActiveGuard,
    _lock: OwnedMutexGuard<()>,
}

struct EngineInner {
    provider: Arc<dyn FileCollectionProvider>,
    store: MetadataStore,
    index: VectorIndexAdapter,
    embedder: Arc<dyn EmbeddingProvider>,
    orchestrator: SyncOrchestrator,
    cache: SyncManagerCache,
    workers: Arc<Semaphore>,
    events: broadcast::Sender<SyncEvent>,
    search: SearchConfig,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build an engine from configuration: SQLite metadata store, the
    /// configured index backend, a filesystem collection provider and the
    /// configured embedding provider.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let store = MetadataStore::open(&config.db.path)
            .await
            .with_context(|| format!("Failed to open metadata store: {}", config.db.path.display()))?;

        let index: Arc<dyn VectorIndex> = match config.index.backend.as_str() {
            "memory" => Arc::new(InMemoryVectorIndex::new()),
            _ => {
                let path = config.index_path();
                Arc::new(
                    SqliteVectorIndex::open(&path)
                        .await
                        .with_context(|| format!("Failed to open vector index: {}", path.display()))?,
                )
            }
        };

        let provider = FsCollectionProvider::new(config.collections_root(), &config.collections)
            .context("Invalid [collections] globs")?;
        let embedder =
            create_provider(&config.embedding).context("Failed to create embedding provider")?;
        let options = EngineOptions::from_config(config)?;

        let parts = EngineParts {
            provider: Arc::new(provider),
            store,
            index,
            embedder,
        };
        Ok(Self::new(parts, options).await?)
    }

    /// Build an engine from explicit collaborators.
    ///
    /// Status rows left `in_progress` by a process that stopped
    /// heartbeating are demoted to `partial`. Passes still running in
    /// another process are left alone.
    pub async fn new(parts: EngineParts, options: EngineOptions) -> Result<Self> {
        let stale_before = now_millis() - HEARTBEAT_STALE_AFTER.as_millis() as i64;
        let interrupted = parts.store.mark_interrupted(stale_before).await?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "recovered interrupted sync passes");
        }

        let (events, _) = broadcast::channel(options.status_channel_capacity.max(1));
        let index = VectorIndexAdapter::new(parts.index);
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&parts.provider),
            parts.store.clone(),
            index.clone(),
            Arc::clone(&parts.embedder),
            options.pass,
            events.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                provider: parts.provider,
                store: parts.store,
                index,
                embedder: parts.embedder,
                orchestrator,
                cache: SyncManagerCache::new(options.cache_capacity),
                workers: Arc::new(Semaphore::new(options.max_concurrent_syncs.max(1))),
                events,
                search: options.search,
            }),
        })
    }

    pub fn store(&self) -> &MetadataStore {
        &self.inner.store
    }

    pub fn index(&self) -> &VectorIndexAdapter {
        &self.inner.index
    }

    // ============ Sync ============

    /// Run a pass and wait for it.
    pub async fn trigger_sync(&self, collection: &str, force_full: bool) -> Result<SyncOutcome> {
        let admission = self.inner.admit(collection)?;
        self.inner.run(admission, force_full).await
    }

    /// Start a pass in the background. Admission (validation and the
    /// per-collection lock) happens before this returns.
    pub fn spawn_sync(&self, collection: &str, force_full: bool) -> Result<SyncJob> {
        let admission = self.inner.admit(collection)?;
        let collection_name = admission.collection.clone();
        let run_id = admission.run_id.clone();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run(admission, force_full).await });
        Ok(SyncJob {
            collection_name,
            run_id,
            handle,
        })
    }

    /// Ask the running pass to stop after its current file. Returns false
    /// if no pass is running for the collection.
    pub fn cancel_sync(&self, collection: &str) -> bool {
        self.inner
            .cache
            .get(collection)
            .map(|h| h.cancel())
            .unwrap_or(false)
    }

    /// Collections with a pass in flight.
    pub fn active_syncs(&self) -> Vec<String> {
        let mut names = self.inner.cache.active_collections();
        names.sort();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    // ============ Status ============

    pub async fn get_sync_status(&self, collection: &str) -> Result<SyncStatus> {
        validate_collection_name(collection)?;
        if let Some(status) = self.inner.store.get_status(collection).await? {
            return Ok(status);
        }
        match self.inner.provider.get_collection(collection).await? {
            Some(_) => Ok(SyncStatus::never_synced(collection)),
            None => Err(SyncError::CollectionNotFound(collection.to_string())),
        }
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionOverview>> {
        let collections = self.inner.provider.list_collections().await?;
        let mut out = Vec::with_capacity(collections.len());
        for info in collections {
            let status = self.inner.store.status_or_default(&info.name).await?;
            let syncing = self
                .inner
                .cache
                .get(&info.name)
                .is_some_and(|h| h.active().is_some());
            out.push(CollectionOverview {
                info,
                status,
                syncing,
            });
        }
        Ok(out)
    }

    /// Most recent drift entries for a collection, newest first.
    pub async fn reconciliation_log(&self, collection: &str, limit: i64) -> Result<Vec<DriftEntry>> {
        validate_collection_name(collection)?;
        self.inner.store.list_drift(collection, limit.max(1)).await
    }

    // ============ Search ============

    /// Scoped semantic search. Each hit carries its collection's current
    /// sync state from the metadata store.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let mut hits = search::search(
            self.inner.provider.as_ref(),
            self.inner.embedder.as_ref(),
            &self.inner.index,
            &self.inner.search,
            request,
        )
        .await?;

        let mut states: HashMap<String, SyncState> = HashMap::new();
        for hit in &mut hits {
            let state = match states.get(&hit.collection_name) {
                Some(state) => *state,
                None => {
                    let state = self
                        .inner
                        .store
                        .status_or_default(&hit.collection_name)
                        .await?
                        .status;
                    states.insert(hit.collection_name.clone(), state);
                    state
                }
            };
            hit.collection_status = Some(state);
        }
        Ok(hits)
    }

    // ============ Maintenance ============

    /// Remove every vector and mapping for a collection. The next pass
    /// re-embeds all of its files. Returns the number of vectors removed.
    pub async fn delete_collection_vectors(&self, collection: &str) -> Result<u64> {
        validate_collection_name(collection)?;
        let handle = self.inner.cache.get_or_insert(collection);
        let _lock = handle
            .try_acquire()
            .ok_or_else(|| SyncError::ConcurrentSync(collection.to_string()))?;

        let removed = self.inner.index.delete_collection(collection).await?;
        let mappings = self.inner.store.delete_all_mappings(collection).await?;

        if let Some(mut status) = self.inner.store.get_status(collection).await? {
            status.status = SyncState::NeverSynced;
            status.vector_count = 0;
            status.file_count = 0;
            status.changed_files_count = 0;
            status.error_message = None;
            status.strategy_fingerprint = None;
            self.inner.store.put_status(&status).await?;
        }

        info!(collection, vectors = removed, mappings, "collection vectors deleted");
        Ok(removed)
    }

    /// Drop everything stored for a collection: vectors, mappings, status
    /// and drift history. Used when the collection itself is deleted.
    /// Returns false if nothing was stored for it.
    pub async fn forget_collection(&self, collection: &str) -> Result<bool> {
        validate_collection_name(collection)?;
        let handle = self.inner.cache.get_or_insert(collection);
        let forgotten = {
            let _lock = handle
                .try_acquire()
                .ok_or_else(|| SyncError::ConcurrentSync(collection.to_string()))?;
            let removed = self.inner.index.delete_collection(collection).await?;
            let known = self.inner.store.forget_collection(collection).await?;
            info!(collection, vectors = removed, "collection forgotten");
            known || removed > 0
        };
        drop(handle);
        self.inner.cache.evict(collection);
        Ok(forgotten)
    }

    pub async fn close(&self) {
        self.inner.store.close().await;
    }
}

impl EngineInner {
    fn admit(&self, collection: &str) -> Result<Admission> {
        validate_collection_name(collection)?;
        let handle = self.cache.get_or_insert(collection);
        let lock = handle
            .try_acquire()
            .ok_or_else(|| SyncError::ConcurrentSync(collection.to_string()))?;

        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        handle.set_active(ActiveSync {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
            started_at: now_millis(),
        });

        Ok(Admission {
            collection: collection.to_string(),
            run_id,
            cancel,
            _active: ActiveGuard { handle },
            _lock: lock,
        })
    }

    async fn run(&self, admission: Admission, force_full: bool) -> Result<SyncOutcome> {
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        // Cancelled while waiting for a worker: nothing was touched
        if admission.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let _heartbeat = self.spawn_heartbeat(&admission.collection);
        self.orchestrator
            .run_pass(
                &admission.collection,
                force_full,
                &admission.run_id,
                &admission.cancel,
            )
            .await
    }

    /// Keep the collection's heartbeat fresh until the guard is dropped.
    fn spawn_heartbeat(&self, collection: &str) -> HeartbeatGuard {
        let store = self.store.clone();
        let collection = collection.to_string();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(HEARTBEAT_INTERVAL);
            // First tick is immediate; begin_sync already stamped the row
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(e) = store.heartbeat(&collection, now_millis()).await {
                    warn!(collection, error = %e, "failed to record sync heartbeat");
                }
            }
        });
        HeartbeatGuard(task)
    }
}

struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
