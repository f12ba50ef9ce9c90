//! File collection providers.
//!
//! A [`FileCollectionProvider`] is the source of truth for which collections
//! exist and what files they contain. The engine only ever reads from it.
//!
//! - [`FsCollectionProvider`]: a root directory with one sub-directory per
//!   collection, walked with `walkdir` and filtered with `globset`.
//! - [`InMemoryCollectionProvider`]: mutable in-process collections, for
//!   tests and embedding the engine in another program.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use walkdir::WalkDir;

use crate::chunk::hash_text;
use crate::config::CollectionsConfig;
use crate::error::{Result, SyncError};
use crate::models::{now_millis, CollectionInfo, FileSnapshot};

#[async_trait]
pub trait FileCollectionProvider: Send + Sync {
    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Every file currently in the collection, sorted by path.
    async fn list_files(&self, name: &str) -> Result<Vec<FileSnapshot>>;
}

/// Collection names: 1–128 chars of `[A-Za-z0-9_.-]`, starting alphanumeric,
/// never containing `..`.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        && !name.contains("..");
    if valid {
        Ok(())
    } else {
        Err(SyncError::Validation(format!(
            "invalid collection name '{}'",
            name
        )))
    }
}

fn snapshot(collection_name: &str, path: String, content: String, modified_at: i64) -> FileSnapshot {
    FileSnapshot {
        collection_name: collection_name.to_string(),
        content_hash: hash_text(&content),
        size: content.len() as u64,
        path,
        content,
        modified_at,
    }
}

// ============ Filesystem ============

pub struct FsCollectionProvider {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FsCollectionProvider {
    pub fn new(root: impl Into<PathBuf>, config: &CollectionsConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root: root.into(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn collection_dir(&self, name: &str) -> Result<PathBuf> {
        validate_collection_name(name)?;
        Ok(self.root.join(name))
    }

    fn info_for(&self, name: &str, dir: &Path) -> CollectionInfo {
        let created_at = std::fs::metadata(dir)
            .and_then(|m| m.created().or_else(|_| m.modified()))
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(now_millis);
        let description = std::fs::read_to_string(dir.join(".description"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        CollectionInfo {
            name: name.to_string(),
            description,
            created_at,
        }
    }
}

#[derive(Clone)]
struct ScanFilter {
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl ScanFilter {
    fn scan(&self, name: &str, dir: &Path) -> Result<Vec<FileSnapshot>> {
        let mut files = Vec::new();

        let walker = WalkDir::new(dir).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry.map_err(|e| SyncError::Provider(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(dir).unwrap_or(path);
            let rel_str = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let bytes = std::fs::read(path)
                .map_err(|e| SyncError::Provider(format!("{}: {}", path.display(), e)))?;
            let content = match String::from_utf8(bytes) {
                Ok(s) => s,
                Err(_) => {
                    tracing::warn!(collection = name, path = %rel_str, "skipping non-UTF-8 file");
                    continue;
                }
            };

            let modified_at = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            files.push(snapshot(name, rel_str, content, modified_at));
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| SyncError::Validation(format!("bad glob '{}': {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| SyncError::Validation(format!("bad glob set: {}", e)))
}

#[async_trait]
impl FileCollectionProvider for FsCollectionProvider {
    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let dir = self.collection_dir(name)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(Some(self.info_for(name, &dir)))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        if !self.root.is_dir() {
            return Err(SyncError::Provider(format!(
                "collections root does not exist: {}",
                self.root.display()
            )));
        }
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| SyncError::Provider(format!("{}: {}", self.root.display(), e)))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::Provider(e.to_string()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_collection_name(&name).is_err() {
                continue;
            }
            out.push(self.info_for(&name, &path));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn list_files(&self, name: &str) -> Result<Vec<FileSnapshot>> {
        let dir = self.collection_dir(name)?;
        if !dir.is_dir() {
            return Err(SyncError::CollectionNotFound(name.to_string()));
        }
        let filter = ScanFilter {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            follow_symlinks: self.follow_symlinks,
        };
        let name = name.to_string();
        tokio::task::spawn_blocking(move || filter.scan(&name, &dir)).await?
    }
}

// ============ In-memory ============

struct MemCollection {
    info: CollectionInfo,
    files: BTreeMap<String, (String, i64)>,
}

/// Collections held in memory. Mutations are visible to the next sync pass.
#[derive(Default)]
pub struct InMemoryCollectionProvider {
    collections: RwLock<BTreeMap<String, MemCollection>>,
    listing_error: RwLock<Option<String>>,
}

impl InMemoryCollectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> SyncError {
        SyncError::Provider("provider lock poisoned".to_string())
    }

    pub fn add_collection(&self, name: &str, description: &str) -> Result<()> {
        validate_collection_name(name)?;
        let mut cols = self.collections.write().map_err(|_| Self::lock_err())?;
        cols.entry(name.to_string()).or_insert_with(|| MemCollection {
            info: CollectionInfo {
                name: name.to_string(),
                description: description.to_string(),
                created_at: now_millis(),
            },
            files: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn remove_collection(&self, name: &str) -> Result<bool> {
        let mut cols = self.collections.write().map_err(|_| Self::lock_err())?;
        Ok(cols.remove(name).is_some())
    }

    /// Create or overwrite a file, creating the collection if needed.
    pub fn put_file(&self, collection: &str, path: &str, content: &str) -> Result<()> {
        self.add_collection(collection, "")?;
        let mut cols = self.collections.write().map_err(|_| Self::lock_err())?;
        if let Some(c) = cols.get_mut(collection) {
            c.files
                .insert(path.to_string(), (content.to_string(), now_millis()));
        }
        Ok(())
    }

    pub fn remove_file(&self, collection: &str, path: &str) -> Result<bool> {
        let mut cols = self.collections.write().map_err(|_| Self::lock_err())?;
        Ok(cols
            .get_mut(collection)
            .map(|c| c.files.remove(path).is_some())
            .unwrap_or(false))
    }

    /// Make `list_files` fail with a provider error until cleared.
    pub fn set_listing_error(&self, message: Option<&str>) -> Result<()> {
        let mut err = self.listing_error.write().map_err(|_| Self::lock_err())?;
        *err = message.map(str::to_string);
        Ok(())
    }
}

#[async_trait]
impl FileCollectionProvider for InMemoryCollectionProvider {
    async fn get_collection(&self, name: &str) -> Result<Option<CollectionInfo>> {
        validate_collection_name(name)?;
        let cols = self.collections.read().map_err(|_| Self::lock_err())?;
        Ok(cols.get(name).map(|c| c.info.clone()))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let cols = self.collections.read().map_err(|_| Self::lock_err())?;
        Ok(cols.values().map(|c| c.info.clone()).collect())
    }

    async fn list_files(&self, name: &str) -> Result<Vec<FileSnapshot>> {
        if let Some(msg) = self
            .listing_error
            .read()
            .map_err(|_| Self::lock_err())?
            .clone()
        {
            return Err(SyncError::Provider(msg));
        }
        let cols = self.collections.read().map_err(|_| Self::lock_err())?;
        let c = cols
            .get(name)
            .ok_or_else(|| SyncError::CollectionNotFound(name.to_string()))?;
        Ok(c.files
            .iter()
            .map(|(path, (content, modified_at))| {
                snapshot(name, path.clone(), content.clone(), *modified_at)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collection_name_validation() {
        for ok in ["docs", "my-notes_2", "a.b", "X"] {
            assert!(validate_collection_name(ok).is_ok(), "{}", ok);
        }
        let long = "x".repeat(129);
        for bad in ["", "-docs", "a/b", "a..b", "..", "has space", long.as_str()] {
            assert!(validate_collection_name(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_in_memory_provider() {
        let p = InMemoryCollectionProvider::new();
        p.put_file("docs", "b.md", "bee").unwrap();
        p.put_file("docs", "a.md", "ay").unwrap();

        let files = p.list_files("docs").await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.md"]);
        assert_eq!(files[0].content_hash, hash_text("ay"));

        assert!(p.remove_file("docs", "a.md").unwrap());
        assert_eq!(p.list_files("docs").await.unwrap().len(), 1);
        assert!(matches!(
            p.list_files("nope").await,
            Err(SyncError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_provider_scans_collection_dirs() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(docs.join("guides")).unwrap();
        std::fs::write(docs.join("a.md"), "# A\n\nHello").unwrap();
        std::fs::write(docs.join("guides/b.txt"), "Bee").unwrap();
        std::fs::write(docs.join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(docs.join("bad.md"), [0xffu8, 0xfe, 0xfd]).unwrap();
        std::fs::create_dir_all(tmp.path().join("notes")).unwrap();

        let p = FsCollectionProvider::new(tmp.path(), &CollectionsConfig {
            root: None,
            include_globs: vec!["**/*.md".into(), "**/*.txt".into()],
            exclude_globs: vec![],
            follow_symlinks: false,
        })
        .unwrap();

        let names: Vec<String> = p
            .list_collections()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["docs", "notes"]);

        let files = p.list_files("docs").await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "guides/b.txt"]);

        assert!(p.get_collection("missing").await.unwrap().is_none());
        assert!(p.get_collection("../etc").await.is_err());
    }
}
