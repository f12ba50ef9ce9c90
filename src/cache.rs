//! Per-collection sync handles kept in a bounded LRU cache.
//!
//! A [`CollectionHandle`] owns the collection's sync lock and the
//! cancellation token of its running pass, if any. Handles are created
//! lazily on first use. When the cache grows past capacity the least
//! recently used **idle** handle is dropped; a handle with a pass in flight
//! (or referenced outside the cache) is never evicted, so two live handles
//! for the same collection cannot exist at once. If every handle is busy the
//! cache temporarily exceeds its capacity.

use lru::LruCache;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// A pass currently running for a collection.
#[derive(Debug, Clone)]
pub struct ActiveSync {
    pub run_id: String,
    pub cancel: CancellationToken,
    pub started_at: i64,
}

#[derive(Debug)]
pub struct CollectionHandle {
    lock: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<ActiveSync>>,
}

impl CollectionHandle {
    fn new() -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            active: Mutex::new(None),
        }
    }

    /// Take the sync lock without waiting. `None` if a pass holds it.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        Arc::clone(&self.lock).try_lock_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveSync>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_active(&self, active: ActiveSync) {
        *self.active_slot() = Some(active);
    }

    pub fn clear_active(&self) {
        *self.active_slot() = None;
    }

    pub fn active(&self) -> Option<ActiveSync> {
        self.active_slot().clone()
    }

    /// Signal the running pass to stop. Returns false if nothing is running.
    pub fn cancel(&self) -> bool {
        match self.active_slot().as_ref() {
            Some(a) => {
                a.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct SyncManagerCache {
    capacity: usize,
    entries: Mutex<LruCache<String, Arc<CollectionHandle>>>,
}

impl SyncManagerCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, Arc<CollectionHandle>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().contains(name)
    }

    /// Existing handle, marked as most recently used.
    pub fn get(&self, name: &str) -> Option<Arc<CollectionHandle>> {
        self.entries().get(name).cloned()
    }

    /// Existing handle or a fresh one, evicting idle handles over capacity.
    pub fn get_or_insert(&self, name: &str) -> Arc<CollectionHandle> {
        let mut entries = self.entries();
        if let Some(h) = entries.get(name) {
            return Arc::clone(h);
        }

        let handle = Arc::new(CollectionHandle::new());
        entries.put(name.to_string(), Arc::clone(&handle));
        evict_overflow(&mut entries, self.capacity, name);
        handle
    }

    /// Drop the handle if it is idle. Returns true if it was removed.
    pub fn evict(&self, name: &str) -> bool {
        let mut entries = self.entries();
        let idle = entries.peek(name).map(is_idle).unwrap_or(false);
        if idle {
            entries.pop(name);
        }
        idle
    }

    /// Names of collections with a pass in flight.
    pub fn active_collections(&self) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|(_, h)| h.active().is_some())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

fn is_idle(handle: &Arc<CollectionHandle>) -> bool {
    Arc::strong_count(handle) == 1 && !handle.is_busy()
}

fn evict_overflow(
    entries: &mut LruCache<String, Arc<CollectionHandle>>,
    capacity: usize,
    keep: &str,
) {
    while entries.len() > capacity {
        // iter() runs most- to least-recently used
        let victim = entries
            .iter()
            .rev()
            .find(|(k, h)| k.as_str() != keep && is_idle(h))
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                tracing::debug!(collection = %key, "evicting idle sync handle");
                entries.pop(&key);
            }
            None => break,
        }
    }
}
