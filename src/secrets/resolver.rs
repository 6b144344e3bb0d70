// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Run-scoped secret resolver
//!
//! One resolver exists per build run. It caches every decoded secret so that
//! repeated requests never hit the store twice, writes file bindings into a
//! private scope directory, and tears all of it down when the run ends (or
//! when it is dropped, whichever comes first).

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{DecodeMode, Redactor, Secret, SecretStore};
use crate::errors::StagehandError;

type SecretSlot = Arc<OnceCell<Option<Arc<Secret>>>>;

/// Resolves, caches and scopes secrets for a single build run
pub struct SecretResolver {
    run_id: String,
    store: Arc<dyn SecretStore>,
    modes: BTreeMap<String, DecodeMode>,
    cache: Mutex<HashMap<String, SecretSlot>>,
    scope_root: Option<PathBuf>,
    scope: Mutex<Option<TempDir>>,
    files: Mutex<HashMap<String, PathBuf>>,
    redactor: Redactor,
    torn_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SecretResolver {
    /// Create a resolver for `run_id`; `modes` maps secret ids to decode modes
    pub fn new(
        run_id: impl Into<String>,
        store: Arc<dyn SecretStore>,
        modes: BTreeMap<String, DecodeMode>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            modes,
            cache: Mutex::new(HashMap::new()),
            scope_root: None,
            scope: Mutex::new(None),
            files: Mutex::new(HashMap::new()),
            redactor: Redactor::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Place the scope directory under `root` instead of the system temp dir
    pub fn with_scope_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scope_root = Some(root.into());
        self
    }

    /// Redactor fed with every value this resolver decodes
    pub fn redactor(&self) -> Redactor {
        self.redactor.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Resolve a secret that may legitimately be absent
    ///
    /// Returns `Ok(None)` when the store has no record (or the record lacks the
    /// decoded field). The outcome is cached for the rest of the run.
    pub async fn resolve_optional(&self, id: &str) -> Result<Option<Arc<Secret>>, StagehandError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(StagehandError::SecretStore {
                message: format!("secret scope of run '{}' is closed", self.run_id),
                help: None,
            });
        }

        let slot = {
            let mut cache = lock(&self.cache);
            cache.entry(id.to_string()).or_default().clone()
        };

        let secret = slot.get_or_try_init(|| self.fetch_and_decode(id)).await?;
        Ok(secret.clone())
    }

    /// Resolve a required secret; absent or empty is `SecretNotFound`
    pub async fn resolve(&self, id: &str) -> Result<Arc<Secret>, StagehandError> {
        match self.resolve_optional(id).await? {
            Some(secret) if !secret.value.is_empty() => Ok(secret),
            _ => Err(StagehandError::SecretNotFound {
                secret: id.to_string(),
            }),
        }
    }

    /// Resolve a required secret as UTF-8 text
    pub async fn resolve_text(&self, id: &str) -> Result<Arc<Secret>, StagehandError> {
        let secret = self.resolve(id).await?;
        if secret.value.expose_str().is_none() {
            return Err(StagehandError::SecretDecode {
                secret: id.to_string(),
                reason: "value is not valid UTF-8".into(),
            });
        }
        Ok(secret)
    }

    async fn fetch_and_decode(&self, id: &str) -> Result<Option<Arc<Secret>>, StagehandError> {
        let mode = self.modes.get(id).cloned().unwrap_or_default();

        let Some(record) = self.store.fetch(id).await? else {
            debug!(run_id = %self.run_id, secret = id, store = self.store.name(), "secret absent");
            return Ok(None);
        };

        let Some(value) = mode.decode(id, &record)? else {
            debug!(run_id = %self.run_id, secret = id, "secret record has no value");
            return Ok(None);
        };

        self.redactor.register(value.expose());
        info!(
            run_id = %self.run_id,
            secret = id,
            bytes = value.len(),
            store = self.store.name(),
            "resolved secret"
        );

        Ok(Some(Arc::new(Secret {
            id: id.to_string(),
            value,
            decode: mode,
            resolved_at: SystemTime::now(),
        })))
    }

    /// Write a secret into the run's scope directory and return the file path
    ///
    /// The same secret is written once per run; later calls return the same path.
    pub fn materialize_file(&self, secret: &Secret) -> Result<PathBuf, StagehandError> {
        let mut files = lock(&self.files);
        if let Some(path) = files.get(&secret.id) {
            return Ok(path.clone());
        }

        let dir = self.scope_dir()?;
        let file_name: String = secret
            .id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(file_name);

        write_private(&path, secret.value.expose())?;
        debug!(run_id = %self.run_id, secret = %secret.id, "materialized secret file");

        files.insert(secret.id.clone(), path.clone());
        Ok(path)
    }

    /// The run's private secret directory, created on first use
    pub fn scope_dir(&self) -> Result<PathBuf, StagehandError> {
        let mut scope = lock(&self.scope);
        if let Some(dir) = scope.as_ref() {
            return Ok(dir.path().to_path_buf());
        }

        let prefix = format!("stagehand-{}-", self.run_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.scope_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| StagehandError::write_failed(root, e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| StagehandError::Io {
            message: format!("failed to create secret scope: {}", e),
        })?;

        let path = dir.path().to_path_buf();
        *scope = Some(dir);
        Ok(path)
    }

    /// Securely discard every secret of this run
    ///
    /// Idempotent. Materialized files are overwritten before removal, the
    /// scope directory is deleted and the in-memory cache is dropped.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let files = std::mem::take(&mut *lock(&self.files));
        for (id, path) in files {
            if let Err(e) = shred(&path) {
                warn!(run_id = %self.run_id, secret = %id, error = %e, "failed to shred secret file");
            }
        }

        if let Some(dir) = lock(&self.scope).take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(run_id = %self.run_id, path = %path.display(), error = %e, "failed to remove secret scope");
            }
        }

        lock(&self.cache).clear();
        self.redactor.clear();

        info!(run_id = %self.run_id, "secret scope torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl Drop for SecretResolver {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), StagehandError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| StagehandError::write_failed(path, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| StagehandError::write_failed(path, e))
}

fn shred(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let len = std::fs::metadata(path)?.len() as usize;
    {
        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.write_all(&vec![0u8; len])?;
        file.sync_all()?;
    }
    std::fs::remove_file(path)
}
