// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Secret resolution
//!
//! Secrets are fetched from an external store as records of named fields
//! (`SecretBinary`, `SecretString`, `Name`), decoded according to a
//! [`DecodeMode`], and cached for the lifetime of a single build run by
//! [`SecretResolver`]. Decoded material lives in [`SecretValue`], which never
//! prints its content and zeroes itself on drop.

mod aws;
mod redact;
mod resolver;
mod store;

pub use aws::AwsCliSecretStore;
pub use redact::Redactor;
pub use resolver::SecretResolver;
pub use store::StaticSecretStore;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::errors::StagehandError;
use crate::pipeline::SecretStoreConfig;

/// Raw secret material as returned by a store
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Named fields, e.g. `SecretBinary`, `SecretString`, `Name`
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl SecretRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Trait for secret store backends
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret record; `Ok(None)` when the store has no such id
    async fn fetch(&self, id: &str) -> Result<Option<SecretRecord>, StagehandError>;

    /// Backend name for logs
    fn name(&self) -> &str;

    /// Check the backend is usable on this agent
    async fn check_available(&self) -> Result<bool, StagehandError> {
        Ok(true)
    }
}

/// Build the store described by the pipeline configuration
pub fn create_store(
    config: &SecretStoreConfig,
    base_dir: &Path,
) -> Result<Arc<dyn SecretStore>, StagehandError> {
    match config {
        SecretStoreConfig::AwsCli { region, profile } => Ok(Arc::new(AwsCliSecretStore::new(
            region.clone(),
            profile.clone(),
        ))),
        SecretStoreConfig::File { path } => {
            Ok(Arc::new(StaticSecretStore::from_file(&base_dir.join(path))?))
        }
    }
}

/// How a record is turned into a value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DecodeMode {
    /// Base64-encoded binary field
    Base64 {
        #[serde(default = "default_binary_field")]
        field: String,
    },
    /// Plain string field, optionally a JSON object from which `key` is taken
    Text {
        #[serde(default = "default_string_field")]
        field: String,
        #[serde(default)]
        key: Option<String>,
    },
}

fn default_binary_field() -> String {
    "SecretBinary".to_string()
}

fn default_string_field() -> String {
    "SecretString".to_string()
}

impl Default for DecodeMode {
    fn default() -> Self {
        Self::Text {
            field: default_string_field(),
            key: None,
        }
    }
}

impl DecodeMode {
    /// Decode a record; `Ok(None)` when the record lacks the field or key
    ///
    /// Decode errors name the secret and the field but never echo content.
    pub fn decode(
        &self,
        secret: &str,
        record: &SecretRecord,
    ) -> Result<Option<SecretValue>, StagehandError> {
        match self {
            Self::Base64 { field } => {
                let Some(encoded) = record.field(field) else {
                    return Ok(None);
                };
                let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
                base64::engine::general_purpose::STANDARD
                    .decode(compact.as_bytes())
                    .map(|bytes| Some(SecretValue::new(bytes)))
                    .map_err(|_| StagehandError::SecretDecode {
                        secret: secret.to_string(),
                        reason: format!("field '{}' is not valid base64", field),
                    })
            }
            Self::Text { field, key: None } => {
                Ok(record.field(field).map(|s| SecretValue::from(s.trim_end())))
            }
            Self::Text {
                field,
                key: Some(key),
            } => {
                let Some(raw) = record.field(field) else {
                    return Ok(None);
                };
                let object: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(raw).map_err(|_| StagehandError::SecretDecode {
                        secret: secret.to_string(),
                        reason: format!("field '{}' is not a JSON object", field),
                    })?;
                match object.get(key) {
                    None | Some(serde_json::Value::Null) => Ok(None),
                    Some(serde_json::Value::String(s)) => Ok(Some(SecretValue::from(s.as_str()))),
                    Some(other) => Ok(Some(SecretValue::new(other.to_string().into_bytes()))),
                }
            }
        }
    }
}

/// Decoded secret bytes
///
/// `Debug` never shows content, and the buffer is overwritten on drop.
pub struct SecretValue(Vec<u8>);

impl SecretValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw bytes; callers must not log them
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Content as UTF-8, if it is
    pub fn expose_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for SecretValue {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretValue([REDACTED; {} bytes])", self.0.len())
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.0.fill(0);
        std::hint::black_box(&self.0);
    }
}

/// A resolved secret, scoped to one build run
#[derive(Debug)]
pub struct Secret {
    pub id: String,
    pub value: SecretValue,
    pub decode: DecodeMode,
    pub resolved_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> SecretRecord {
        SecretRecord {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_decode_base64_binary() {
        let mode = DecodeMode::Base64 {
            field: "SecretBinary".into(),
        };
        let value = mode
            .decode("LICENSE", &record(&[("SecretBinary", "aGVs\nbG8=")]))
            .unwrap()
            .unwrap();
        assert_eq!(value.expose(), b"hello");
    }

    #[test]
    fn test_decode_invalid_base64_does_not_echo_content() {
        let mode = DecodeMode::Base64 {
            field: "SecretBinary".into(),
        };
        let err = mode
            .decode("LICENSE", &record(&[("SecretBinary", "hunter2-!!")]))
            .unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_decode_json_key_from_secret_string() {
        let mode = DecodeMode::Text {
            field: "SecretString".into(),
            key: Some("TEAM_ID".into()),
        };
        let value = mode
            .decode("TEAM_ID", &record(&[("SecretString", r#"{"TEAM_ID":"ABCDE12345"}"#)]))
            .unwrap()
            .unwrap();
        assert_eq!(value.expose_str(), Some("ABCDE12345"));
    }

    #[test]
    fn test_decode_missing_field_is_absent() {
        let mode = DecodeMode::Text {
            field: "Name".into(),
            key: None,
        };
        assert!(mode.decode("X", &record(&[])).unwrap().is_none());
    }

    #[test]
    fn test_secret_value_debug_is_redacted() {
        let value = SecretValue::from("correct horse battery staple");
        let debug = format!("{:?}", value);
        assert!(!debug.contains("horse"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_decode_mode_yaml() {
        let mode: DecodeMode = serde_yaml::from_str("mode: text\nkey: APP_BUNDLE\n").unwrap();
        assert_eq!(
            mode,
            DecodeMode::Text {
                field: "SecretString".into(),
                key: Some("APP_BUNDLE".into()),
            }
        );
        let mode: DecodeMode = serde_yaml::from_str("mode: base64\n").unwrap();
        assert_eq!(
            mode,
            DecodeMode::Base64 {
                field: "SecretBinary".into()
            }
        );
    }
}
