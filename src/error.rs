//! Error taxonomy for the sync engine.
//!
//! Every operation exposed by [`SyncEngine`](crate::engine::SyncEngine)
//! returns [`SyncError`]. Errors fall into three groups:
//!
//! | Group | Variants | Behaviour |
//! |-------|----------|-----------|
//! | Caller errors | `Validation`, `CollectionNotFound`, `ConcurrentSync` | surfaced immediately, never retried |
//! | Transient | `EmbeddingProvider`, `VectorIndex`, `Timeout` | retried with backoff at file granularity |
//! | Drift | `CorruptMapping` | logged to the reconciliation log, file resynced |
//!
//! Anything else (`Store`, `Provider`, `Serialization`) is treated as fatal
//! for the pass that hit it.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad collection name or query parameters.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// A sync pass is already running for this collection.
    #[error("sync already in progress for collection '{0}'")]
    ConcurrentSync(String),

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// Non-retryable embedding failure (bad request, misconfiguration).
    #[error("embedding provider rejected request: {0}")]
    EmbeddingRejected(String),

    #[error("vector index error: {0}")]
    VectorIndex(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Mapped chunk ids that the index can no longer resolve.
    #[error("mapping for {collection}/{file_path} references {missing} chunk(s) missing from the index")]
    CorruptMapping {
        collection: String,
        file_path: String,
        missing: usize,
    },

    /// File collection provider failure (listing, reading).
    #[error("file collection provider error: {0}")]
    Provider(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("metadata store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::EmbeddingProvider(_) | SyncError::VectorIndex(_) | SyncError::Timeout { .. }
        )
    }

    /// Short machine-readable tag, used in status messages and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::CollectionNotFound(_) => "collection_not_found",
            SyncError::ConcurrentSync(_) => "concurrent_sync",
            SyncError::EmbeddingProvider(_) => "embedding_provider",
            SyncError::EmbeddingRejected(_) => "embedding_rejected",
            SyncError::VectorIndex(_) => "vector_index",
            SyncError::Timeout { .. } => "timeout",
            SyncError::CorruptMapping { .. } => "corrupt_mapping",
            SyncError::Provider(_) => "provider",
            SyncError::Cancelled => "cancelled",
            SyncError::Store(_) => "store",
            SyncError::Serialization(_) => "serialization",
            SyncError::Join(_) => "join",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::EmbeddingProvider("503".into()).is_transient());
        assert!(SyncError::VectorIndex("busy".into()).is_transient());
        assert!(SyncError::Timeout {
            operation: "embed".into(),
            secs: 5
        }
        .is_transient());

        assert!(!SyncError::Validation("bad".into()).is_transient());
        assert!(!SyncError::EmbeddingRejected("400".into()).is_transient());
        assert!(!SyncError::ConcurrentSync("docs".into()).is_transient());
        assert!(!SyncError::CollectionNotFound("docs".into()).is_transient());
    }

    #[test]
    fn test_concurrent_sync_message_names_collection() {
        let e = SyncError::ConcurrentSync("docs".into());
        assert_eq!(e.kind(), "concurrent_sync");
        assert!(e.to_string().contains("'docs'"));
    }
}
