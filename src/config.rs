//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/meta.sqlite"
//!
//! [index]
//! backend = "sqlite"            # or "memory"
//! path = "./data/vectors.sqlite"
//!
//! [collections]
//! root = "./collections"        # one sub-directory per collection
//!
//! [chunking]
//! strategy = "structural"       # or "paragraph"
//! max_tokens = 256
//! overlap_fraction = 0.25
//!
//! [embedding]
//! provider = "hash"             # disabled | hash | openai | ollama | local
//! dims = 256
//!
//! [sync]
//! max_concurrent_syncs = 4
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::ChunkingStrategy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub collections: CollectionsConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_backend")]
    pub backend: String,
    /// Defaults to `vectors.sqlite` next to the metadata database.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            path: None,
        }
    }
}

fn default_index_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CollectionsConfig {
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub max_tokens: usize,
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
}

fn default_strategy() -> String {
    "structural".to_string()
}
fn default_overlap_fraction() -> f64 {
    0.25
}
fn default_min_tokens() -> usize {
    16
}

impl ChunkingConfig {
    /// Resolve the configured strategy name into a [`ChunkingStrategy`].
    ///
    /// Called once per sync pass; the result is threaded through the
    /// pipeline unchanged.
    pub fn resolve(&self) -> Result<ChunkingStrategy> {
        match self.strategy.as_str() {
            "structural" => Ok(ChunkingStrategy::Structural {
                max_tokens: self.max_tokens,
                overlap_fraction: self.overlap_fraction,
                min_tokens: self.min_tokens.min(self.max_tokens),
            }),
            "paragraph" => Ok(ChunkingStrategy::Paragraph {
                max_tokens: self.max_tokens,
            }),
            other => bail!(
                "Unknown chunking strategy: '{}'. Must be structural or paragraph.",
                other
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum embedding batches in flight per file.
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
    /// HTTP client timeout for remote providers.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            fan_out: default_fan_out(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_fan_out() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Worker pool size: passes running at once across all collections.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,
    /// Per-collection handles kept in memory.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Retries per file after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Timeout for each embedding or index call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Check that unchanged files still have their vectors in the index.
    #[serde(default = "default_verify_index")]
    pub verify_index: bool,
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_syncs: default_max_concurrent_syncs(),
            cache_capacity: default_cache_capacity(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            verify_index: default_verify_index(),
            status_channel_capacity: default_status_channel_capacity(),
        }
    }
}

fn default_max_concurrent_syncs() -> usize {
    4
}
fn default_cache_capacity() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_verify_index() -> bool {
    true
}
fn default_status_channel_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default)]
    pub score_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            score_threshold: 0.0,
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_max_k() -> usize {
    100
}

impl Config {
    /// Directory holding one sub-directory per collection.
    pub fn collections_root(&self) -> PathBuf {
        match &self.collections.root {
            Some(p) => p.clone(),
            None => PathBuf::from("collections"),
        }
    }

    /// Path of the SQLite vector index file.
    pub fn index_path(&self) -> PathBuf {
        match &self.index.path {
            Some(p) => p.clone(),
            None => self
                .db
                .path
                .parent()
                .map(|p| p.join("vectors.sqlite"))
                .unwrap_or_else(|| PathBuf::from("vectors.sqlite")),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if !(0.0..0.5).contains(&config.chunking.overlap_fraction) {
        bail!("chunking.overlap_fraction must be in [0.0, 0.5)");
    }
    config.chunking.resolve()?;

    // Index
    match config.index.backend.as_str() {
        "sqlite" | "memory" => {}
        other => bail!(
            "Unknown index backend: '{}'. Must be sqlite or memory.",
            other
        ),
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.fan_out == 0 {
        bail!("embedding.fan_out must be > 0");
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Sync
    if config.sync.max_concurrent_syncs == 0 {
        bail!("sync.max_concurrent_syncs must be > 0");
    }
    if config.sync.cache_capacity == 0 {
        bail!("sync.cache_capacity must be > 0");
    }
    if config.sync.status_channel_capacity == 0 {
        bail!("sync.status_channel_capacity must be > 0");
    }

    // Search
    if config.search.default_k == 0 || config.search.default_k > config.search.max_k {
        bail!("search.default_k must be in [1, search.max_k]");
    }
    if !(-1.0..=1.0).contains(&config.search.score_threshold) {
        bail!("search.score_threshold must be in [-1.0, 1.0]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Config {
        let text = format!(
            r#"
[db]
path = "/tmp/meta.sqlite"

[chunking]
max_tokens = 128
{}
"#,
            extra
        );
        toml::from_str(&text).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse("");
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.chunking.strategy, "structural");
        assert!((cfg.chunking.overlap_fraction - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.index.backend, "sqlite");
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.sync.max_concurrent_syncs, 4);
        assert!(cfg.sync.verify_index);
        assert_eq!(cfg.index_path(), PathBuf::from("/tmp/vectors.sqlite"));
    }

    #[test]
    fn test_rejects_large_overlap() {
        let cfg = parse("overlap_fraction = 0.6");
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("overlap_fraction"));
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let cfg = parse("strategy = \"semantic\"");
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_openai_requires_model_and_dims() {
        let mut cfg = parse("");
        cfg.embedding.provider = "openai".to_string();
        assert!(validate(&cfg).is_err());
        cfg.embedding.model = Some("text-embedding-3-small".to_string());
        cfg.embedding.dims = Some(1536);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_resolve_paragraph_strategy() {
        let cfg = parse("strategy = \"paragraph\"");
        assert_eq!(
            cfg.chunking.resolve().unwrap(),
            ChunkingStrategy::Paragraph { max_tokens: 128 }
        );
    }
}
