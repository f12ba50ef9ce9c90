//! Change detection between the provider's current files and stored mappings.
//!
//! A file is **added** when no mapping exists for its path, **modified** when
//! its content hash differs from the mapping's `file_hash_at_sync`, and
//! **deleted** when a mapping exists but the provider no longer lists it.
//! A mapping built with a different strategy fingerprint (chunking
//! parameters or embedding model) also counts as modified.
//! With `force_full` every current file is reported as modified (or added
//! when unmapped), so the whole collection is re-chunked and re-embedded.

use std::collections::{HashMap, HashSet};

use crate::models::{FileSnapshot, FileVectorMapping};

/// Paths partitioned by change kind, each sorted ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
            .any(|p| p == path)
    }

    /// Promote an unchanged path to modified, e.g. after its vectors went missing.
    pub fn mark_modified(&mut self, path: &str) {
        if self.contains(path) {
            return;
        }
        let pos = self.modified.partition_point(|p| p.as_str() < path);
        self.modified.insert(pos, path.to_string());
    }
}

/// Compute the set of files whose vectors are out of date.
pub fn diff(
    current: &[FileSnapshot],
    mappings: &[FileVectorMapping],
    force_full: bool,
    fingerprint: &str,
) -> ChangeSet {
    let by_path: HashMap<&str, &FileVectorMapping> = mappings
        .iter()
        .map(|m| (m.file_path.as_str(), m))
        .collect();
    let current_paths: HashSet<&str> = current.iter().map(|f| f.path.as_str()).collect();

    let mut changes = ChangeSet::default();

    for file in current {
        match by_path.get(file.path.as_str()) {
            None => changes.added.push(file.path.clone()),
            Some(m)
                if force_full
                    || m.file_hash_at_sync != file.content_hash
                    || m.strategy_fingerprint != fingerprint =>
            {
                changes.modified.push(file.path.clone())
            }
            Some(_) => {}
        }
    }

    for m in mappings {
        if !current_paths.contains(m.file_path.as_str()) {
            changes.deleted.push(m.file_path.clone());
        }
    }

    changes.added.sort();
    changes.added.dedup();
    changes.modified.sort();
    changes.modified.dedup();
    changes.deleted.sort();
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, hash: &str) -> FileSnapshot {
        FileSnapshot {
            collection_name: "docs".into(),
            path: path.into(),
            content: String::new(),
            content_hash: hash.into(),
            size: 0,
            modified_at: 0,
        }
    }

    fn mapping(path: &str, hash: &str) -> FileVectorMapping {
        FileVectorMapping {
            collection_name: "docs".into(),
            file_path: path.into(),
            file_hash_at_sync: hash.into(),
            chunk_ids: vec![],
            chunk_count: 0,
            last_synced_at: 0,
            processing_time_ms: 0,
            strategy_fingerprint: "fp".into(),
        }
    }

    #[test]
    fn test_first_sync_everything_added() {
        let cs = diff(&[file("b.md", "2"), file("a.md", "1")], &[], false, "fp");
        assert_eq!(cs.added, vec!["a.md", "b.md"]);
        assert!(cs.modified.is_empty());
        assert!(cs.deleted.is_empty());
    }

    #[test]
    fn test_unchanged_is_empty() {
        let cs = diff(&[file("a.md", "1")], &[mapping("a.md", "1")], false, "fp");
        assert!(cs.is_empty());
    }

    #[test]
    fn test_added_modified_deleted() {
        let current = [file("a.md", "1"), file("b.md", "new"), file("d.md", "4")];
        let mappings = [
            mapping("a.md", "1"),
            mapping("b.md", "old"),
            mapping("c.md", "3"),
        ];
        let cs = diff(&current, &mappings, false, "fp");
        assert_eq!(cs.added, vec!["d.md"]);
        assert_eq!(cs.modified, vec!["b.md"]);
        assert_eq!(cs.deleted, vec!["c.md"]);
        assert_eq!(cs.len(), 3);
    }

    #[test]
    fn test_force_full_marks_unchanged_modified() {
        let current = [file("a.md", "1"), file("b.md", "2")];
        let cs = diff(&current, &[mapping("a.md", "1")], true, "fp");
        assert_eq!(cs.added, vec!["b.md"]);
        assert_eq!(cs.modified, vec!["a.md"]);
    }

    #[test]
    fn test_fingerprint_change_marks_modified() {
        let mut old = mapping("a.md", "1");
        old.strategy_fingerprint = "structural:v1|hash:64".into();
        let cs = diff(
            &[file("a.md", "1"), file("b.md", "2")],
            &[old, mapping("b.md", "2")],
            false,
            "fp",
        );
        assert_eq!(cs.modified, vec!["a.md"]);
        assert!(cs.added.is_empty());
    }

    #[test]
    fn test_everything_deleted() {
        let cs = diff(&[], &[mapping("a.md", "1"), mapping("b.md", "2")], false, "fp");
        assert_eq!(cs.deleted, vec!["a.md", "b.md"]);
    }

    #[test]
    fn test_mark_modified_keeps_order_and_skips_known() {
        let mut cs = diff(
            &[file("a.md", "1"), file("c.md", "x")],
            &[mapping("a.md", "1"), mapping("c.md", "3")],
            false,
            "fp",
        );
        cs.mark_modified("a.md");
        cs.mark_modified("c.md");
        assert_eq!(cs.modified, vec!["a.md", "c.md"]);
    }
}
