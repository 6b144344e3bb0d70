// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! In-memory / file-backed secret store
//!
//! Used for local runs (`secret_store: { kind: file, path: ... }`) and tests.
//! The file maps secret ids to records:
//!
//! ```yaml
//! TEAM_ID:
//!   Name: TEAM_ID
//!   SecretString: '{"TEAM_ID":"ABCDE12345"}'
//! ```

use async_trait::async_trait;
use base64::Engine;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{SecretRecord, SecretStore};
use crate::errors::StagehandError;

/// Secret store holding its records in memory
#[derive(Debug, Default)]
pub struct StaticSecretStore {
    records: BTreeMap<String, SecretRecord>,
    fetches: AtomicUsize,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load records from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, StagehandError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StagehandError::read_failed(path, e))?;
        let records: BTreeMap<String, SecretRecord> = serde_yaml::from_str(&content)?;

        Ok(Self {
            records,
            fetches: AtomicUsize::new(0),
        })
    }

    /// Add a binary secret, stored base64-encoded as `SecretBinary`
    pub fn with_binary(mut self, id: &str, bytes: &[u8]) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        self.records.insert(
            id.to_string(),
            SecretRecord {
                fields: BTreeMap::from([
                    ("Name".to_string(), id.to_string()),
                    ("SecretBinary".to_string(), encoded),
                ]),
            },
        );
        self
    }

    /// Add a string secret, stored as `SecretString`
    pub fn with_string(mut self, id: &str, value: &str) -> Self {
        self.records.insert(
            id.to_string(),
            SecretRecord {
                fields: BTreeMap::from([
                    ("Name".to_string(), id.to_string()),
                    ("SecretString".to_string(), value.to_string()),
                ]),
            },
        );
        self
    }

    /// Number of `fetch` calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn fetch(&self, id: &str) -> Result<Option<SecretRecord>, StagehandError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.get(id).cloned())
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fetch_counts_calls() {
        let store = StaticSecretStore::new().with_string("TEAM_ID", "abc");

        assert!(store.fetch("TEAM_ID").await.unwrap().is_some());
        assert!(store.fetch("MISSING").await.unwrap().is_none());
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_load_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secrets.yaml");
        std::fs::write(
            &path,
            "APP_BUNDLE:\n  Name: APP_BUNDLE\n  SecretString: '{\"APP_BUNDLE\":\"com.example.app\"}'\n",
        )
        .unwrap();

        let store = StaticSecretStore::from_file(&path).unwrap();
        let record = store.fetch("APP_BUNDLE").await.unwrap().unwrap();
        assert_eq!(record.field("Name"), Some("APP_BUNDLE"));
    }
}
