// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Build runs
//!
//! A [`BuildRun`] is created for every trigger event and records what each
//! stage did. It owns the run's [`SecretResolver`], whose secrets never
//! outlive the run.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::cache::unique_token;
use crate::errors::StagehandError;
use crate::pipeline::Pipeline;
use crate::secrets::SecretResolver;
use crate::signing::PackagingDecision;

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────────────────

/// Observes a cancellation request
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token nobody can cancel
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if it never can be
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Requests cancellation of every token made with it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

// ─────────────────────────────────────────────────────────────────────────────
// Run inputs
// ─────────────────────────────────────────────────────────────────────────────

/// What started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    /// Run every stage
    Manual,
    /// Files changed; run the stages watching them and what they depend on
    Change { paths: Vec<String> },
}

/// Per-run settings threaded into every stage
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Directory relative paths in the pipeline resolve against
    pub base_dir: PathBuf,
    /// Parent directory of the stage workspaces
    pub workspace_root: PathBuf,
    /// Overrides `params.code_sign_identity`
    pub code_sign_identity: Option<String>,
    pub trigger: TriggerEvent,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            workspace_root: base_dir.clone(),
            base_dir,
            code_sign_identity: None,
            trigger: TriggerEvent::Manual,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_code_sign_identity(mut self, identity: Option<String>) -> Self {
        self.code_sign_identity = identity;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerEvent) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Run id: seconds since the epoch plus a random suffix
pub fn new_run_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}-{}", secs, &unique_token()[..8])
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    StepFailure { step: String, exit_code: i32 },
    ArtifactMissing { artifact: String },
    ArtifactPublish { source_path: String },
    SecretNotFound { secret: String },
    NoAgentAvailable { requirements: Vec<String> },
    Error { message: String },
}

impl FailureReason {
    pub fn from_error(err: &StagehandError) -> Self {
        match err {
            StagehandError::StepFailure {
                step, exit_code, ..
            } => Self::StepFailure {
                step: step.clone(),
                exit_code: *exit_code,
            },
            StagehandError::ArtifactMissing { artifact, .. } => Self::ArtifactMissing {
                artifact: artifact.clone(),
            },
            StagehandError::ArtifactSourceMissing { source_path, .. } => Self::ArtifactPublish {
                source_path: source_path.clone(),
            },
            StagehandError::SecretNotFound { secret } => Self::SecretNotFound {
                secret: secret.clone(),
            },
            StagehandError::NoAgentAvailable { requirements, .. } => Self::NoAgentAvailable {
                requirements: requirements
                    .split(", ")
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            },
            other => Self::Error {
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepFailure { step, exit_code } => {
                write!(f, "step '{}' exited with code {}", step, exit_code)
            }
            Self::ArtifactMissing { artifact } => write!(f, "artifact '{}' missing", artifact),
            Self::ArtifactPublish { source_path } => {
                write!(f, "cannot publish '{}': source missing", source_path)
            }
            Self::SecretNotFound { secret } => write!(f, "secret '{}' not found", secret),
            Self::NoAgentAvailable { requirements } => {
                write!(f, "no agent with [{}]", requirements.join(", "))
            }
            Self::Error { message } => write!(f, "{}", message),
        }
    }
}

/// Why a stage did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// An upstream stage did not succeed
    UpstreamFailed { stage: String },
    /// Not selected by the trigger event or `--stage`
    NotSelected,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamFailed { stage } => write!(f, "upstream '{}' did not succeed", stage),
            Self::NotSelected => write!(f, "not selected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    /// Planned but not run (dry runs)
    Pending,
    Succeeded,
    Failed(FailureReason),
    Skipped(SkipReason),
    Cancelled,
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub exit_code: i32,
    pub duration: Duration,
}

/// What one stage did during a run
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub agent: Option<String>,
    pub packaging: Option<PackagingDecision>,
    pub steps: Vec<StepReport>,
    /// Artifacts published by this stage
    pub artifacts: Vec<String>,
    /// Cache rules restored before the steps ran
    pub cache_restored: Vec<String>,
    /// Non-fatal problems (cache writes, mostly)
    pub warnings: Vec<String>,
    /// Redacted step output
    pub log: String,
    pub duration: Duration,
}

impl StageReport {
    pub fn new(stage: impl Into<String>, status: StageStatus) -> Self {
        Self {
            stage: stage.into(),
            status,
            agent: None,
            packaging: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
            cache_restored: Vec::new(),
            warnings: Vec::new(),
            log: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Whether step `name` ran
    pub fn ran_step(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// One execution of a pipeline
pub struct BuildRun {
    pub run_id: String,
    pub pipeline: Arc<Pipeline>,
    pub trigger: TriggerEvent,
    /// Reports in execution order
    pub reports: Vec<StageReport>,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub dry_run: bool,
    secrets: Arc<SecretResolver>,
}

impl BuildRun {
    pub fn new(
        run_id: String,
        pipeline: Arc<Pipeline>,
        trigger: TriggerEvent,
        secrets: Arc<SecretResolver>,
    ) -> Self {
        Self {
            run_id,
            pipeline,
            trigger,
            reports: Vec::new(),
            started_at: SystemTime::now(),
            duration: Duration::ZERO,
            dry_run: false,
            secrets,
        }
    }

    pub fn secrets(&self) -> &SecretResolver {
        &self.secrets
    }

    pub fn report(&self, stage: &str) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }

    pub fn status(&self) -> RunStatus {
        let statuses = || self.reports.iter().map(|r| &r.status);
        if statuses().any(|s| matches!(s, StageStatus::Cancelled)) {
            RunStatus::Cancelled
        } else if statuses().any(|s| {
            matches!(
                s,
                StageStatus::Failed(_) | StageStatus::Skipped(SkipReason::UpstreamFailed { .. })
            )
        }) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }

    /// Failed stages and why
    pub fn failures(&self) -> Vec<(&str, &FailureReason)> {
        self.reports
            .iter()
            .filter_map(|r| match &r.status {
                StageStatus::Failed(reason) => Some((r.stage.as_str(), reason)),
                _ => None,
            })
            .collect()
    }

    /// Run report as pretty JSON; logs are already redacted
    pub fn to_json(&self) -> Result<String, StagehandError> {
        #[derive(Serialize)]
        struct Summary<'a> {
            run_id: &'a str,
            pipeline: &'a str,
            trigger: &'a TriggerEvent,
            status: RunStatus,
            dry_run: bool,
            duration: Duration,
            stages: &'a [StageReport],
        }

        let summary = Summary {
            run_id: &self.run_id,
            pipeline: &self.pipeline.id,
            trigger: &self.trigger,
            status: self.status(),
            dry_run: self.dry_run,
            duration: self.duration,
            stages: &self.reports,
        };
        serde_json::to_string_pretty(&summary).map_err(Into::into)
    }
}

impl std::fmt::Debug for BuildRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRun")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline.id)
            .field("trigger", &self.trigger)
            .field("reports", &self.reports)
            .field("duration", &self.duration)
            .finish()
    }
}
