// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Content hashing for cache keys and snapshots
//!
//! Uses BLAKE3 for fast, secure content hashing.

use blake3::Hasher;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::errors::StagehandError;

/// Content hasher for snapshot digests
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    /// Create a new content hasher
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Hash a directory tree (relative paths and contents) or a single file
    ///
    /// Entries are visited in sorted order so equal trees hash equally.
    pub fn hash_tree(&mut self, root: &Path) -> Result<(), StagehandError> {
        if root.is_file() {
            return self.hash_file(root);
        }

        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| StagehandError::CacheError {
                message: format!("Failed to walk '{}': {}", root.display(), e),
            })?;
            if entry.file_type().is_dir() {
                continue;
            }

            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            self.hasher.update(relative.to_string_lossy().as_bytes());
            self.hasher.update(&[0]);
            if entry.file_type().is_file() {
                self.hash_file(entry.path())?;
            }
        }

        Ok(())
    }

    /// Hash a single file's contents
    pub fn hash_file(&mut self, path: &Path) -> Result<(), StagehandError> {
        let content = std::fs::read(path).map_err(|e| StagehandError::read_failed(path, e))?;
        self.hasher.update(&content);
        Ok(())
    }

    /// Hash arbitrary bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and get the hash
    pub fn finalize(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a quick hash of a string
pub fn hash_string(s: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// A name no other writer on this machine will pick
pub fn unique_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());

    let hex = hasher.finalize().to_hex();
    hex.as_str()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_string() {
        let hash1 = hash_string("hello");
        let hash2 = hash_string("hello");
        let hash3 = hash_string("world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn test_tree_hash_tracks_names_and_content() {
        let temp_dir = TempDir::new().unwrap();
        let tree = temp_dir.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/a.txt"), "one").unwrap();

        let digest = |root: &Path| {
            let mut hasher = ContentHasher::new();
            hasher.hash_tree(root).unwrap();
            hasher.finalize()
        };

        let before = digest(&tree);
        assert_eq!(before, digest(&tree));

        std::fs::write(tree.join("sub/a.txt"), "two").unwrap();
        let changed = digest(&tree);
        assert_ne!(before, changed);

        std::fs::rename(tree.join("sub/a.txt"), tree.join("sub/b.txt")).unwrap();
        assert_ne!(changed, digest(&tree));
    }

    #[test]
    fn test_unique_tokens_differ() {
        let a = unique_token();
        let b = unique_token();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
