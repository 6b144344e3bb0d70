// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Caching layer for workspace paths
//!
//! Stages declare workspace paths (a package cache, say) that survive between
//! runs. A stored path becomes an immutable snapshot; readers only ever see a
//! complete snapshot.

mod filesystem;
mod hash;

pub use filesystem::FilesystemCache;
pub use hash::{hash_string, unique_token, ContentHasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use crate::errors::StagehandError;

/// Identity of a cache entry: the same rule of the same stage shares one entry across runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub pipeline: String,
    pub stage: String,
    pub rule: String,
}

impl CacheKey {
    pub fn new(
        pipeline: impl Into<String>,
        stage: impl Into<String>,
        rule: impl Into<String>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            rule: rule.into(),
        }
    }

    /// Stable on-disk identifier
    pub fn digest(&self) -> String {
        hash_string(&format!("{}\0{}\0{}", self.pipeline, self.stage, self.rule))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pipeline, self.stage, self.rule)
    }
}

/// Trait for cache implementations
#[async_trait]
pub trait Cache: Send + Sync {
    /// Replace `target` with the current snapshot; `Ok(false)` on a miss, target untouched
    async fn restore(&self, key: &CacheKey, target: &Path) -> Result<bool, StagehandError>;

    /// Snapshot `source` and make it the current entry for `key`
    async fn store(&self, key: &CacheKey, source: &Path) -> Result<(), StagehandError>;

    /// Invalidate a single entry
    async fn invalidate(&self, key: &CacheKey) -> Result<(), StagehandError>;

    /// Clear all cached entries
    async fn clear(&self) -> Result<(), StagehandError>;

    /// Get cache statistics
    async fn stats(&self) -> Result<CacheStats, StagehandError>;
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached entries
    pub entries: usize,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Oldest entry timestamp
    pub oldest_entry: Option<SystemTime>,
    /// Newest entry timestamp
    pub newest_entry: Option<SystemTime>,
}

impl CacheStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }
}

/// Metadata written next to every snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub key: CacheKey,
    /// Snapshot directory name
    pub snapshot: String,
    pub created_at: SystemTime,
    /// BLAKE3 digest of the snapshot content
    pub content_digest: String,
    pub size_bytes: u64,
    /// Whether the cached path was a single file
    pub is_file: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_digest_is_stable_and_distinct() {
        let a = CacheKey::new("unity-ios", "build-unity-project", "UnityPackages");
        let b = CacheKey::new("unity-ios", "build-unity-project", "UnityPackages");
        let c = CacheKey::new("unity-ios", "build-ios-app", "UnityPackages");

        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.to_string(), "unity-ios/build-unity-project/UnityPackages");
    }

    #[test]
    fn test_formatted_size() {
        let stats = CacheStats {
            size_bytes: 3 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(stats.formatted_size(), "3.00 MB");
        assert_eq!(CacheStats::default().formatted_size(), "0 bytes");
    }
}
