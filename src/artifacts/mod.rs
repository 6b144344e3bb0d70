// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Artifact store
//!
//! Artifacts are named directory trees kept per run and per producing stage:
//!
//! ```text
//! <root>/<run id>/<stage id>/<artifact name>/...
//! <root>/<run id>/<stage id>/MANIFEST.json
//! ```
//!
//! A stage's artifacts are assembled in a staging directory and moved into
//! place only once every rule succeeded; the manifest is written last and is
//! the only thing readers trust.
//!
//! Consuming replaces what earlier runs extracted: named destinations are
//! cleared, and files extracted into the workspace root are tracked in a
//! ledger so the next run can remove them.

mod rule;

pub use rule::{ArtifactRule, RuleSource};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cache::unique_token;
use crate::errors::{StagehandError, StagehandResult};
use crate::utils::fs::{copy_dir_contents, copy_into, relative_files, remove_path, tree_size};

const MANIFEST: &str = "MANIFEST.json";
const CONSUMED_LEDGER: &str = ".stagehand-consumed";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a stage published
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub run_id: String,
    pub stage: String,
    pub published_at: SystemTime,
    pub artifacts: BTreeMap<String, ArtifactEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub files: u64,
    pub size_bytes: u64,
}

/// Directory-backed artifact store
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stage_dir(&self, run: &str, stage: &str) -> PathBuf {
        self.root.join(run).join(stage)
    }

    /// Publish every rule of `stage`, reading sources from `workspace`
    ///
    /// Either all rules publish or none do. A missing source fails with
    /// `ArtifactSourceMissing` and leaves nothing behind.
    pub fn publish(
        &self,
        run: &str,
        stage: &str,
        workspace: &Path,
        rules: &[ArtifactRule],
    ) -> StagehandResult<ArtifactManifest> {
        let stage_dir = self.stage_dir(run, stage);
        std::fs::create_dir_all(&stage_dir)
            .map_err(|e| StagehandError::write_failed(&stage_dir, e))?;

        let staging = stage_dir.join(format!(".staging-{}", unique_token()));
        let result = self.assemble(stage, workspace, rules, &staging);
        let artifacts = match result {
            Ok(artifacts) => artifacts,
            Err(e) => {
                let _ = remove_path(&staging);
                return Err(e);
            }
        };

        for name in artifacts.keys() {
            let target = stage_dir.join(name);
            remove_path(&target).map_err(|e| StagehandError::write_failed(&target, e))?;
            std::fs::rename(staging.join(name), &target)
                .map_err(|e| StagehandError::write_failed(&target, e))?;
        }
        let _ = remove_path(&staging);

        let manifest = ArtifactManifest {
            run_id: run.to_string(),
            stage: stage.to_string(),
            published_at: SystemTime::now(),
            artifacts,
        };
        write_manifest(&stage_dir, &manifest)?;

        info!(
            run_id = run,
            stage,
            artifacts = ?manifest.artifacts.keys().collect::<Vec<_>>(),
            "published artifacts"
        );
        Ok(manifest)
    }

    fn assemble(
        &self,
        stage: &str,
        workspace: &Path,
        rules: &[ArtifactRule],
        staging: &Path,
    ) -> StagehandResult<BTreeMap<String, ArtifactEntry>> {
        let mut names = Vec::new();

        for rule in rules {
            let RuleSource::Path(source) = rule.source() else {
                return Err(StagehandError::InvalidArtifactRule {
                    rule: rule.to_string(),
                    reason: "archive selectors cannot be published".into(),
                });
            };
            let (name, subdir) = rule.publish_target();
            if name.is_empty() {
                return Err(StagehandError::InvalidArtifactRule {
                    rule: rule.to_string(),
                    reason: "destination names no artifact".into(),
                });
            }

            let sources = resolve_sources(workspace, source)?;
            if sources.is_empty() {
                return Err(StagehandError::ArtifactSourceMissing {
                    stage: stage.to_string(),
                    source_path: source.clone(),
                });
            }

            let target = staging.join(&name).join(subdir);
            for path in sources {
                debug!(stage, source = %path.display(), artifact = %name, "copying into artifact");
                copy_into(&path, &target).map_err(|e| StagehandError::write_failed(&target, e))?;
            }
            names.push(name);
        }

        let mut artifacts = BTreeMap::new();
        for name in names {
            let dir = staging.join(&name);
            let files = WalkDir::new(&dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| !e.file_type().is_dir())
                .count() as u64;
            artifacts.insert(
                name,
                ArtifactEntry {
                    files,
                    size_bytes: tree_size(&dir),
                },
            );
        }
        Ok(artifacts)
    }

    /// Manifest of a stage, if it has published
    pub fn manifest(&self, run: &str, stage: &str) -> Option<ArtifactManifest> {
        let path = self.stage_dir(run, stage).join(MANIFEST);
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn is_published(&self, run: &str, stage: &str, artifact: &str) -> bool {
        self.manifest(run, stage)
            .is_some_and(|m| m.artifacts.contains_key(artifact))
    }

    /// Wait until `artifact` of `stage` is published, up to `timeout`
    pub async fn wait_for(
        &self,
        run: &str,
        stage: &str,
        artifact: &str,
        timeout: Duration,
    ) -> StagehandResult<PathBuf> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_published(run, stage, artifact) {
                return Ok(self.stage_dir(run, stage).join(artifact));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StagehandError::ArtifactMissing {
                    stage: stage.to_string(),
                    artifact: artifact.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Clear what earlier runs extracted into `workspace` for `rules`
    ///
    /// Named destinations are removed outright. Files an earlier run placed in
    /// the workspace root are removed using the ledger it left behind.
    pub fn reset_destinations<'a>(
        &self,
        workspace: &Path,
        rules: impl IntoIterator<Item = &'a ArtifactRule>,
    ) -> StagehandResult<()> {
        for rule in rules {
            if rule.extracts_into_root() {
                continue;
            }
            let target = workspace.join(rule.destination());
            remove_path(&target).map_err(|e| StagehandError::write_failed(&target, e))?;
        }

        let ledger = workspace.join(CONSUMED_LEDGER);
        let Ok(content) = std::fs::read_to_string(&ledger) else {
            return Ok(());
        };
        for line in content.lines().filter(|l| !l.is_empty()) {
            let path = workspace.join(line);
            remove_path(&path).map_err(|e| StagehandError::write_failed(&path, e))?;
        }
        remove_path(&ledger).map_err(|e| StagehandError::write_failed(&ledger, e))?;
        debug!(workspace = %workspace.display(), "cleared previously consumed artifacts");
        Ok(())
    }

    /// Extract an artifact of `upstream` into `workspace` according to `rule`
    ///
    /// Returns the number of files written.
    pub fn consume(
        &self,
        run: &str,
        upstream: &str,
        rule: &ArtifactRule,
        workspace: &Path,
    ) -> StagehandResult<u64> {
        let artifact = rule.consumed_artifact();
        if !self.is_published(run, upstream, &artifact) {
            return Err(StagehandError::ArtifactMissing {
                stage: upstream.to_string(),
                artifact,
            });
        }

        let source = self.stage_dir(run, upstream).join(&artifact);
        let target = workspace.join(rule.destination());

        let (copied, written) = match rule.source() {
            RuleSource::Path(path) => {
                let (_, inner) = rule::split_path(path);
                let from = source.join(inner);
                if !from.exists() {
                    return Err(StagehandError::ArtifactMissing {
                        stage: upstream.to_string(),
                        artifact: path.clone(),
                    });
                }
                let written = if from.is_dir() {
                    relative_files(&from)
                } else {
                    from.file_name().map(PathBuf::from).into_iter().collect()
                };
                let copied = copy_into(&from, &target)
                    .map_err(|e| StagehandError::write_failed(&target, e))?;
                (copied, written)
            }
            RuleSource::Archive { pattern, .. } => extract_matching(&source, pattern, &target)?,
        };

        if rule.extracts_into_root() {
            record_consumed(workspace, &written)?;
        }

        info!(run_id = run, upstream, artifact = %artifact, files = copied, "consumed artifact");
        Ok(copied)
    }

    /// Every `(stage, artifact)` published in `run`
    pub fn list(&self, run: &str) -> Vec<(String, String)> {
        let Ok(entries) = std::fs::read_dir(self.root.join(run)) else {
            return Vec::new();
        };

        let mut out: Vec<(String, String)> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|stage| self.manifest(run, &stage))
            .flat_map(|m| {
                let stage = m.stage.clone();
                m.artifacts
                    .into_keys()
                    .map(move |name| (stage.clone(), name))
            })
            .collect();
        out.sort();
        out
    }
}

/// Workspace paths a publish source names; glob characters expand
fn resolve_sources(workspace: &Path, source: &str) -> StagehandResult<Vec<PathBuf>> {
    if !source.contains(['*', '?', '[']) {
        let path = workspace.join(source);
        return Ok(if path.exists() { vec![path] } else { vec![] });
    }

    let pattern = workspace.join(source).to_string_lossy().to_string();
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(Result::ok).collect();
    matches.sort();
    Ok(matches)
}

/// Copy entries of `artifact` whose relative path matches `pattern`
///
/// Returns the count and the relative paths written.
fn extract_matching(
    artifact: &Path,
    pattern: &str,
    target: &Path,
) -> StagehandResult<(u64, Vec<PathBuf>)> {
    if pattern == "**" {
        let written = relative_files(artifact);
        let copied = copy_dir_contents(artifact, target)
            .map_err(|e| StagehandError::write_failed(target, e))?;
        return Ok((copied, written));
    }

    let matcher = glob::Pattern::new(pattern)?;
    let mut written = Vec::new();
    for entry in WalkDir::new(artifact).min_depth(1) {
        let entry = entry.map_err(|e| StagehandError::Io {
            message: e.to_string(),
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(artifact) else {
            continue;
        };
        if !matcher.matches_path(relative) {
            continue;
        }

        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StagehandError::write_failed(parent, e))?;
        }
        std::fs::copy(entry.path(), &dest).map_err(|e| StagehandError::write_failed(&dest, e))?;
        written.push(relative.to_path_buf());
    }
    Ok((written.len() as u64, written))
}

/// Append extracted paths to the workspace ledger
fn record_consumed(workspace: &Path, written: &[PathBuf]) -> StagehandResult<()> {
    use std::io::Write;

    let ledger = workspace.join(CONSUMED_LEDGER);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&ledger)
        .map_err(|e| StagehandError::write_failed(&ledger, e))?;
    for path in written {
        writeln!(file, "{}", path.to_string_lossy().replace('\\', "/"))
            .map_err(|e| StagehandError::write_failed(&ledger, e))?;
    }
    Ok(())
}

fn write_manifest(stage_dir: &Path, manifest: &ArtifactManifest) -> StagehandResult<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    let tmp = stage_dir.join(format!(".{}.{}", MANIFEST, unique_token()));
    let path = stage_dir.join(MANIFEST);
    std::fs::write(&tmp, json).map_err(|e| StagehandError::write_failed(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| StagehandError::write_failed(&path, e))
}
