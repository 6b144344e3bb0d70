// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Filesystem-based cache implementation
//!
//! Layout, per key:
//!
//! ```text
//! <cache dir>/<digest[..2]>/<digest>.lock              writer lock
//! <cache dir>/<digest[..2]>/<digest>/CURRENT          name of the live snapshot
//! <cache dir>/<digest[..2]>/<digest>/snap-<ts>-<tok>/  meta.json + data
//! ```
//!
//! A snapshot is fully written before `CURRENT` is replaced by rename, so a
//! reader resolves either the previous snapshot or the new one. Writers of a
//! key hold an exclusive lock from snapshot creation through pruning, so
//! pruning never removes a snapshot that is still being written.

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::{unique_token, Cache, CacheKey, CacheStats, ContentHasher, SnapshotInfo};
use crate::errors::StagehandError;
use crate::utils::fs::{copy_dir_contents, remove_path, tree_size};

const CURRENT: &str = "CURRENT";
const META: &str = "meta.json";
const DATA: &str = "data";
const SNAPSHOT_PREFIX: &str = "snap-";
const WRITING: &str = ".writing";

/// Filesystem-based cache
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    /// Cache directory
    cache_dir: PathBuf,
    /// Snapshots kept per key besides the live one
    retain: usize,
}

impl FilesystemCache {
    /// Create a new filesystem cache
    pub fn new(cache_dir: PathBuf, retain: usize) -> Result<Self, StagehandError> {
        if !cache_dir.exists() {
            std::fs::create_dir_all(&cache_dir).map_err(|e| StagehandError::CacheError {
                message: format!("Failed to create cache directory: {}", e),
            })?;
        }

        Ok(Self {
            cache_dir,
            retain: retain.max(1),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding all snapshots of a key
    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        let digest = key.digest();
        // First 2 chars as directory for better filesystem performance
        let (prefix, _) = digest.split_at(2);
        self.cache_dir.join(prefix).join(&digest)
    }

    /// Take the writer lock of a key; released when the file is dropped
    fn lock_entry(&self, key: &CacheKey) -> std::io::Result<File> {
        let entry_dir = self.entry_dir(key);
        let parent = entry_dir.parent().unwrap_or(&self.cache_dir);
        std::fs::create_dir_all(parent)?;
        let lock = File::create(entry_dir.with_extension("lock"))?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    /// Live snapshot of an entry, if any
    fn current_snapshot(entry_dir: &Path) -> Option<PathBuf> {
        let name = std::fs::read_to_string(entry_dir.join(CURRENT)).ok()?;
        let snapshot = entry_dir.join(name.trim());
        snapshot.join(META).is_file().then_some(snapshot)
    }

    fn read_info(snapshot: &Path) -> Option<SnapshotInfo> {
        let content = std::fs::read_to_string(snapshot.join(META)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn restore_blocking(&self, key: &CacheKey, target: &Path) -> Result<bool, StagehandError> {
        let entry_dir = self.entry_dir(key);
        let Some(snapshot) = Self::current_snapshot(&entry_dir) else {
            debug!(key = %key, "cache miss");
            return Ok(false);
        };
        let Some(info) = Self::read_info(&snapshot) else {
            return Ok(false);
        };

        let parent = target.parent().unwrap_or(target);
        std::fs::create_dir_all(parent).map_err(|e| StagehandError::write_failed(parent, e))?;

        // Assemble next to the target, then swap it in
        let staging = parent.join(format!(".stagehand-restore-{}", unique_token()));
        let copied = if info.is_file {
            std::fs::copy(snapshot.join(DATA), &staging).map(|_| ())
        } else {
            copy_dir_contents(&snapshot.join(DATA), &staging).map(|_| ())
        };
        if let Err(e) = copied {
            let _ = remove_path(&staging);
            return Err(StagehandError::CacheError {
                message: format!("Failed to restore '{}': {}", key, e),
            });
        }

        // A snapshot pruned mid-copy must not be mistaken for a hit
        let mut hasher = ContentHasher::new();
        let verified = hasher
            .hash_tree(&staging)
            .map(|_| hasher.finalize() == info.content_digest)
            .unwrap_or(false);
        if !verified {
            let _ = remove_path(&staging);
            return Err(StagehandError::CacheError {
                message: format!("Snapshot '{}' of '{}' changed while restoring", info.snapshot, key),
            });
        }

        remove_path(target).map_err(|e| StagehandError::write_failed(target, e))?;
        std::fs::rename(&staging, target).map_err(|e| {
            let _ = remove_path(&staging);
            StagehandError::write_failed(target, e)
        })?;

        info!(key = %key, snapshot = %info.snapshot, "restored cache");
        Ok(true)
    }

    fn store_blocking(&self, key: &CacheKey, source: &Path) -> Result<(), StagehandError> {
        let write_failure = |message: String| StagehandError::CacheWriteFailure {
            key: key.to_string(),
            message,
        };

        if !source.exists() {
            return Err(write_failure(format!(
                "'{}' does not exist",
                source.display()
            )));
        }

        let _lock = self
            .lock_entry(key)
            .map_err(|e| write_failure(format!("failed to lock entry: {}", e)))?;

        let entry_dir = self.entry_dir(key);
        std::fs::create_dir_all(&entry_dir).map_err(|e| write_failure(e.to_string()))?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let name = format!("{}{:020}-{}", SNAPSHOT_PREFIX, nanos, unique_token());
        let snapshot = entry_dir.join(&name);

        let result = Self::write_snapshot(key, source, &snapshot, &name)
            .and_then(|_| Self::swap_current(&entry_dir, &name));
        if let Err(e) = result {
            let _ = remove_path(&snapshot);
            return Err(write_failure(e.to_string()));
        }

        info!(key = %key, snapshot = %name, "stored cache");
        self.prune(&entry_dir);
        Ok(())
    }

    fn write_snapshot(
        key: &CacheKey,
        source: &Path,
        snapshot: &Path,
        name: &str,
    ) -> Result<(), StagehandError> {
        std::fs::create_dir_all(snapshot)?;
        std::fs::write(snapshot.join(WRITING), "")?;

        let data = snapshot.join(DATA);
        let is_file = source.is_file();
        if is_file {
            std::fs::copy(source, &data)?;
        } else {
            copy_dir_contents(source, &data)?;
        }

        let mut hasher = ContentHasher::new();
        hasher.hash_tree(&data)?;

        // Copying recreates directories, so a snapshot removed by `clear`
        // shows up only as a missing marker
        if !snapshot.join(WRITING).is_file() {
            return Err(StagehandError::CacheError {
                message: format!("snapshot '{}' was removed while writing", name),
            });
        }

        let info = SnapshotInfo {
            key: key.clone(),
            snapshot: name.to_string(),
            created_at: SystemTime::now(),
            content_digest: hasher.finalize(),
            size_bytes: tree_size(&data),
            is_file,
        };
        std::fs::write(snapshot.join(META), serde_json::to_string_pretty(&info)?)?;
        std::fs::remove_file(snapshot.join(WRITING))?;
        Ok(())
    }

    /// Point `CURRENT` at `name` with a single rename
    fn swap_current(entry_dir: &Path, name: &str) -> Result<(), StagehandError> {
        let tmp = entry_dir.join(format!(".{}.{}", CURRENT, unique_token()));
        std::fs::write(&tmp, name)?;
        std::fs::rename(&tmp, entry_dir.join(CURRENT)).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            e.into()
        })
    }

    /// Drop old snapshots, never the live one; caller holds the entry lock
    fn prune(&self, entry_dir: &Path) {
        let live = std::fs::read_to_string(entry_dir.join(CURRENT))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let Ok(entries) = std::fs::read_dir(entry_dir) else {
            return;
        };
        let mut snapshots: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with(SNAPSHOT_PREFIX))
            .collect();
        // Names start with a zero-padded timestamp, newest last
        snapshots.sort();

        let keep_from = snapshots.len().saturating_sub(self.retain);
        for name in &snapshots[..keep_from] {
            if *name == live {
                continue;
            }
            if let Err(e) = remove_path(&entry_dir.join(name)) {
                warn!(snapshot = %name, error = %e, "failed to prune cache snapshot");
            }
        }
    }

    /// Every live entry in the cache
    pub fn entries(&self) -> Result<Vec<SnapshotInfo>, StagehandError> {
        let mut infos = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(infos);
        }

        for prefix_dir in std::fs::read_dir(&self.cache_dir).map_err(|e| {
            StagehandError::CacheError {
                message: format!("Failed to read cache directory: {}", e),
            }
        })? {
            let prefix_dir = prefix_dir
                .map_err(|e| StagehandError::CacheError {
                    message: format!("Failed to read cache entry: {}", e),
                })?
                .path();

            if !prefix_dir.is_dir() {
                continue;
            }

            for entry_dir in std::fs::read_dir(&prefix_dir).map_err(|e| {
                StagehandError::CacheError {
                    message: format!("Failed to read cache subdirectory: {}", e),
                }
            })? {
                let Ok(entry_dir) = entry_dir else {
                    continue;
                };
                if let Some(info) =
                    Self::current_snapshot(&entry_dir.path()).and_then(|s| Self::read_info(&s))
                {
                    infos.push(info);
                }
            }
        }

        infos.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        Ok(infos)
    }
}

async fn blocking<T, F>(task: F) -> Result<T, StagehandError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StagehandError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StagehandError::CacheError {
            message: format!("cache task failed: {}", e),
        })?
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn restore(&self, key: &CacheKey, target: &Path) -> Result<bool, StagehandError> {
        let (this, key, target) = (self.clone(), key.clone(), target.to_path_buf());
        blocking(move || this.restore_blocking(&key, &target)).await
    }

    async fn store(&self, key: &CacheKey, source: &Path) -> Result<(), StagehandError> {
        let (this, key, source) = (self.clone(), key.clone(), source.to_path_buf());
        blocking(move || this.store_blocking(&key, &source)).await
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), StagehandError> {
        let (this, key) = (self.clone(), key.clone());
        blocking(move || {
            let entry_dir = this.entry_dir(&key);
            if !entry_dir.exists() {
                return Ok(());
            }
            let _lock = this.lock_entry(&key)?;
            std::fs::remove_dir_all(&entry_dir).map_err(|e| StagehandError::CacheError {
                message: format!("Failed to remove cache entry: {}", e),
            })
        })
        .await
    }

    async fn clear(&self) -> Result<(), StagehandError> {
        if self.cache_dir.exists() {
            tokio::fs::remove_dir_all(&self.cache_dir)
                .await
                .map_err(|e| StagehandError::CacheError {
                    message: format!("Failed to clear cache: {}", e),
                })?;

            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| StagehandError::CacheError {
                    message: format!("Failed to recreate cache directory: {}", e),
                })?;
        }

        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, StagehandError> {
        let this = self.clone();
        let entries = blocking(move || this.entries()).await?;

        let mut stats = CacheStats {
            entries: entries.len(),
            size_bytes: 0,
            oldest_entry: entries.iter().map(|e| e.created_at).min(),
            newest_entry: entries.iter().map(|e| e.created_at).max(),
        };

        if self.cache_dir.exists() {
            stats.size_bytes = tree_size(&self.cache_dir);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn key() -> CacheKey {
        CacheKey::new("unity-ios", "build-unity-project", "UnityPackages")
    }

    fn write_version(dir: &Path, version: usize) {
        std::fs::create_dir_all(dir.join("packages")).unwrap();
        for i in 0..8 {
            std::fs::write(dir.join(format!("packages/p{}.txt", i)), version.to_string())
                .unwrap();
        }
    }

    /// Version of a restored tree, or panic if files disagree
    fn read_version(dir: &Path) -> String {
        let versions: Vec<String> = (0..8)
            .map(|i| std::fs::read_to_string(dir.join(format!("packages/p{}.txt", i))).unwrap())
            .collect();
        assert!(
            versions.iter().all(|v| v == &versions[0]),
            "mixed snapshot: {:?}",
            versions
        );
        versions[0].clone()
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let source = temp_dir.path().join("ws/Library");
        write_version(&source, 1);
        cache.store(&key(), &source).await.unwrap();

        let target = temp_dir.path().join("other/Library");
        assert!(cache.restore(&key(), &target).await.unwrap());
        assert_eq!(read_version(&target), "1");
    }

    #[tokio::test]
    async fn test_restore_miss_leaves_target_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let target = temp_dir.path().join("ws/Library");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("keep.txt"), "mine").unwrap();

        assert!(!cache.restore(&key(), &target).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(target.join("keep.txt")).unwrap(),
            "mine"
        );

        let absent = temp_dir.path().join("ws/Absent");
        assert!(!cache.restore(&key(), &absent).await.unwrap());
        assert!(!absent.exists());
    }

    #[tokio::test]
    async fn test_restore_replaces_stale_target() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let source = temp_dir.path().join("src");
        write_version(&source, 7);
        cache.store(&key(), &source).await.unwrap();

        let target = temp_dir.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.txt"), "old").unwrap();

        assert!(cache.restore(&key(), &target).await.unwrap());
        assert!(!target.join("stale.txt").exists());
        assert_eq!(read_version(&target), "7");
    }

    #[tokio::test]
    async fn test_single_file_entry() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let source = temp_dir.path().join("lockfile.json");
        std::fs::write(&source, "{}").unwrap();
        cache.store(&key(), &source).await.unwrap();

        let target = temp_dir.path().join("restored/lockfile.json");
        assert!(cache.restore(&key(), &target).await.unwrap());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_store_missing_source_is_write_failure() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let err = cache
            .store(&key(), &temp_dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StagehandError::CacheWriteFailure { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_stores_never_mix() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Arc::new(FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap());

        let mut handles = Vec::new();
        for version in 1..=4 {
            let source = temp_dir.path().join(format!("run-{}", version));
            write_version(&source, version);
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.store(&key(), &source).await.unwrap();
            }));
        }

        // Readers racing the writers see old-or-new, never a mixture
        for i in 0..8 {
            let target = temp_dir.path().join(format!("reader-{}", i));
            if let Ok(true) = cache.restore(&key(), &target).await {
                read_version(&target);
            }
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let target = temp_dir.path().join("final");
        assert!(cache.restore(&key(), &target).await.unwrap());
        let version: usize = read_version(&target).parse().unwrap();
        assert!((1..=4).contains(&version));
    }

    #[tokio::test]
    async fn test_slow_store_racing_fast_stores_is_never_partial() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Arc::new(FilesystemCache::new(temp_dir.path().join("cache"), 1).unwrap());

        let large = temp_dir.path().join("large");
        std::fs::create_dir_all(&large).unwrap();
        for i in 0..3000 {
            std::fs::write(large.join(format!("f{}.txt", i)), "large").unwrap();
        }
        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.store(&key(), &large).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        for i in 0..2 {
            let small = temp_dir.path().join(format!("small-{}", i));
            std::fs::create_dir_all(&small).unwrap();
            std::fs::write(small.join("only.txt"), "small").unwrap();
            cache.store(&key(), &small).await.unwrap();
        }
        slow.await.unwrap().unwrap();

        let target = temp_dir.path().join("restored");
        assert!(cache.restore(&key(), &target).await.unwrap());
        let files = std::fs::read_dir(&target).unwrap().count();
        assert!(files == 1 || files == 3000, "partial snapshot with {} files", files);
    }

    #[tokio::test]
    async fn test_sequential_stores_keep_latest_and_prune() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        for version in 1..=5 {
            let source = temp_dir.path().join(format!("run-{}", version));
            write_version(&source, version);
            cache.store(&key(), &source).await.unwrap();
        }

        let target = temp_dir.path().join("final");
        cache.restore(&key(), &target).await.unwrap();
        assert_eq!(read_version(&target), "5");

        let snapshots = std::fs::read_dir(cache.entry_dir(&key()))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(SNAPSHOT_PREFIX))
            .count();
        assert_eq!(snapshots, 2);
    }

    #[tokio::test]
    async fn test_cache_invalidate() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let source = temp_dir.path().join("src");
        write_version(&source, 1);
        cache.store(&key(), &source).await.unwrap();

        cache.invalidate(&key()).await.unwrap();
        assert!(!cache
            .restore(&key(), &temp_dir.path().join("t"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cache_clear_and_stats() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"), 2).unwrap();

        let source = temp_dir.path().join("src");
        write_version(&source, 1);
        cache.store(&key(), &source).await.unwrap();
        cache
            .store(&CacheKey::new("p", "s", "other"), &source)
            .await
            .unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.size_bytes > 0);
        assert!(stats.oldest_entry <= stats.newest_entry);
        assert_eq!(cache.entries().unwrap().len(), 2);

        cache.clear().await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 0);
    }
}
