//! Semantic search over synced collections.
//!
//! The query is embedded with the same provider used for syncing and
//! matched against the vector index with the collection and chunk-type
//! constraints pushed into the index filter. Results are never
//! post-filtered here, so `k` always means "up to k matching chunks".
//!
//! Searching a collection the provider does not know fails with
//! [`SyncError::CollectionNotFound`]; a known collection that has never
//! been synced simply yields no hits.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::config::SearchConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{Result, SyncError};
use crate::index::{MetadataFilter, ScoredRecord, VectorIndexAdapter};
use crate::models::{ChunkType, SyncState};
use crate::provider::{validate_collection_name, FileCollectionProvider};

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// `None` searches every collection.
    pub collection_name: Option<String>,
    /// Defaults to `search.default_k`.
    pub k: Option<usize>,
    /// Defaults to `search.score_threshold`.
    pub score_threshold: Option<f32>,
    /// Empty means any type.
    pub chunk_types: Vec<ChunkType>,
    /// Attach the chunks each hit overlaps with.
    pub expand_overlaps: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn in_collection(mut self, name: impl Into<String>) -> Self {
        self.collection_name = Some(name.into());
        self
    }

    pub fn limit(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
    pub collection_name: String,
    pub file_path: String,
    pub chunk_index: i64,
    pub chunk_type: ChunkType,
    pub header_path: Vec<String>,
    pub line_start: usize,
    pub line_end: usize,
    pub text: String,
    pub overlap_source: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub neighbors: Vec<NeighborChunk>,
    /// Sync state of the hit's collection when the search ran. Anything
    /// but `completed` means results may lag the collection's files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_status: Option<SyncState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborChunk {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub text: String,
}

impl From<ScoredRecord> for SearchHit {
    fn from(hit: ScoredRecord) -> Self {
        let r = hit.record;
        Self {
            chunk_id: r.id,
            score: hit.score,
            collection_name: r.collection_name,
            file_path: r.file_path,
            chunk_index: r.chunk_index,
            chunk_type: r.chunk_type,
            header_path: r.header_path,
            line_start: r.line_start,
            line_end: r.line_end,
            text: r.text,
            overlap_source: r.overlap_source,
            neighbors: Vec::new(),
            collection_status: None,
        }
    }
}

/// Validated `(k, threshold)` for a request.
fn resolve_limits(config: &SearchConfig, request: &SearchRequest) -> Result<(usize, f32)> {
    if request.query.trim().is_empty() {
        return Err(SyncError::Validation("query must not be empty".to_string()));
    }
    let k = request.k.unwrap_or(config.default_k);
    if k == 0 || k > config.max_k {
        return Err(SyncError::Validation(format!(
            "k must be in [1, {}], got {}",
            config.max_k, k
        )));
    }
    let threshold = request.score_threshold.unwrap_or(config.score_threshold);
    if !(-1.0..=1.0).contains(&threshold) {
        return Err(SyncError::Validation(format!(
            "score_threshold must be in [-1.0, 1.0], got {}",
            threshold
        )));
    }
    Ok((k, threshold))
}

pub async fn search(
    provider: &dyn FileCollectionProvider,
    embedder: &dyn EmbeddingProvider,
    index: &VectorIndexAdapter,
    config: &SearchConfig,
    request: &SearchRequest,
) -> Result<Vec<SearchHit>> {
    let (k, threshold) = resolve_limits(config, request)?;

    if let Some(name) = &request.collection_name {
        validate_collection_name(name)?;
        if provider.get_collection(name).await?.is_none() {
            return Err(SyncError::CollectionNotFound(name.clone()));
        }
    }

    let vector = embed_query(embedder, request.query.trim()).await?;
    let filter = MetadataFilter {
        collection_name: request.collection_name.clone(),
        chunk_types: request.chunk_types.clone(),
    };
    let mut hits: Vec<SearchHit> = index
        .search(&vector, &filter, k, threshold)
        .await?
        .into_iter()
        .map(SearchHit::from)
        .collect();

    if request.expand_overlaps {
        attach_neighbors(index, &mut hits).await?;
    }

    tracing::debug!(
        collection = request.collection_name.as_deref().unwrap_or("*"),
        k,
        hits = hits.len(),
        "search complete"
    );
    Ok(hits)
}

async fn attach_neighbors(index: &VectorIndexAdapter, hits: &mut [SearchHit]) -> Result<()> {
    let mut seen = HashSet::new();
    let ids: Vec<String> = hits
        .iter()
        .flat_map(|h| h.overlap_source.iter())
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();
    if ids.is_empty() {
        return Ok(());
    }

    let by_id: HashMap<String, NeighborChunk> = index
        .get_chunks(&ids)
        .await?
        .into_iter()
        .map(|r| {
            (
                r.id.clone(),
                NeighborChunk {
                    chunk_id: r.id,
                    chunk_index: r.chunk_index,
                    text: r.text,
                },
            )
        })
        .collect();

    for hit in hits.iter_mut() {
        hit.neighbors = hit
            .overlap_source
            .iter()
            .filter_map(|id| by_id.get(id).cloned())
            .collect();
    }
    Ok(())
}

// ============ CLI output ============

pub fn print_hits(hits: &[SearchHit], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let caveat = match hit.collection_status {
            Some(state) if state != SyncState::Completed => format!("  (collection {})", state),
            _ => String::new(),
        };
        println!(
            "{}. [{:.2}] {} / {}{}",
            i + 1,
            hit.score,
            hit.collection_name,
            hit.file_path,
            caveat
        );
        if !hit.header_path.is_empty() {
            println!("    section: {}", hit.header_path.join(" > "));
        }
        println!(
            "    lines: {}-{} ({})",
            hit.line_start,
            hit.line_end,
            hit.chunk_type.as_str()
        );
        println!("    excerpt: \"{}\"", excerpt(&hit.text, 240));
        for n in &hit.neighbors {
            println!("    overlaps #{}: \"{}\"", n.chunk_index, excerpt(&n.text, 120));
        }
        println!("    id: {}", hit.chunk_id);
        println!();
    }
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk, ChunkingStrategy, FileRef};
    use crate::embedding::HashProvider;
    use crate::index::InMemoryVectorIndex;
    use crate::provider::InMemoryCollectionProvider;
    use std::sync::Arc;

    const DIMS: usize = 64;

    struct Fixture {
        provider: InMemoryCollectionProvider,
        embedder: HashProvider,
        index: VectorIndexAdapter,
        config: SearchConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let provider = InMemoryCollectionProvider::new();
            provider.add_collection("alpha", "").unwrap();
            provider.add_collection("beta", "").unwrap();
            provider.add_collection("empty", "").unwrap();
            Self {
                provider,
                embedder: HashProvider::new(DIMS),
                index: VectorIndexAdapter::new(Arc::new(InMemoryVectorIndex::new())),
                config: SearchConfig {
                    score_threshold: -1.0,
                    ..SearchConfig::default()
                },
            }
        }

        async fn index_file(&self, collection: &str, path: &str, text: &str, max_tokens: usize) {
            let strategy = ChunkingStrategy::Structural {
                max_tokens,
                overlap_fraction: 0.25,
                min_tokens: 0,
            };
            let chunks = chunk(
                text,
                FileRef {
                    collection_name: collection,
                    file_path: path,
                },
                &strategy,
            );
            let vectors: Vec<Vec<f32>> =
                chunks.iter().map(|c| self.embedder.embed_one(&c.text)).collect();
            self.index.upsert_chunks(&chunks, &vectors).await.unwrap();
        }

        async fn run(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
            search(
                &self.provider,
                &self.embedder,
                &self.index,
                &self.config,
                request,
            )
            .await
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_requests() {
        let fx = Fixture::new();
        let err = fx.run(&SearchRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = fx
            .run(&SearchRequest::new("hello").limit(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = fx
            .run(&SearchRequest::new("hello").limit(10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let mut req = SearchRequest::new("hello");
        req.score_threshold = Some(2.0);
        assert!(matches!(
            fx.run(&req).await.unwrap_err(),
            SyncError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_collection_is_not_found() {
        let fx = Fixture::new();
        let err = fx
            .run(&SearchRequest::new("hello").in_collection("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CollectionNotFound(_)));
    }

    #[tokio::test]
    async fn test_never_synced_collection_is_empty() {
        let fx = Fixture::new();
        fx.index_file("alpha", "a.md", "hello world", 64).await;
        let hits = fx
            .run(&SearchRequest::new("hello world").in_collection("empty"))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_scoped_search_stays_in_collection() {
        let fx = Fixture::new();
        fx.index_file("alpha", "a.md", "rust ownership and borrowing", 64)
            .await;
        fx.index_file("beta", "b.md", "rust ownership and borrowing", 64)
            .await;

        let hits = fx
            .run(&SearchRequest::new("rust ownership").in_collection("beta"))
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.collection_name == "beta"));

        let global = fx.run(&SearchRequest::new("rust ownership")).await.unwrap();
        let collections: HashSet<&str> =
            global.iter().map(|h| h.collection_name.as_str()).collect();
        assert_eq!(collections.len(), 2);
    }

    #[tokio::test]
    async fn test_chunk_type_filter() {
        let fx = Fixture::new();
        let doc = "# Setup\n\nInstall the tool first.\n\n```sh\ncargo install tool\n```\n";
        fx.index_file("alpha", "setup.md", doc, 64).await;

        let mut req = SearchRequest::new("install tool").in_collection("alpha");
        req.chunk_types = vec![ChunkType::Code];
        let hits = fx.run(&req).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.chunk_type == ChunkType::Code));
    }

    #[tokio::test]
    async fn test_expand_overlaps_attaches_neighbors() {
        let fx = Fixture::new();
        let para = "lorem ipsum dolor sit amet consectetur adipiscing elit ".repeat(6);
        let doc = format!("{}\n\n{}\n\n{}", para, para, para);
        fx.index_file("alpha", "long.md", &doc, 32).await;

        let mut req = SearchRequest::new("lorem ipsum").in_collection("alpha");
        req.expand_overlaps = true;
        let hits = fx.run(&req).await.unwrap();
        let with_overlap: Vec<&SearchHit> = hits
            .iter()
            .filter(|h| !h.overlap_source.is_empty())
            .collect();
        assert!(!with_overlap.is_empty());
        for h in with_overlap {
            assert_eq!(h.neighbors.len(), h.overlap_source.len());
        }
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("a\nb   c", 10), "a b c");
        assert_eq!(excerpt("ééééé", 3), "ééé...");
    }
}
