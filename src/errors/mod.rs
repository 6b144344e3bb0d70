// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Error types
//!
//! Every variant names the stage, step, secret id or artifact involved.
//! None of them ever carries a resolved secret value.

mod recovery;

pub use recovery::RecoverySuggestion;

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for stagehand operations
pub type StagehandResult<T> = Result<T, StagehandError>;

/// Main error type for stagehand
#[derive(Error, Debug, Diagnostic)]
pub enum StagehandError {
    // ─────────────────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Step '{step}' of stage '{stage}' exited with code {exit_code}")]
    #[diagnostic(
        code(stagehand::step_failure),
        help("Inspect the stage log; steps are never retried automatically")
    )]
    StepFailure {
        stage: String,
        step: String,
        exit_code: i32,
    },

    #[error("Tool '{tool}' execution failed: {error}")]
    #[diagnostic(code(stagehand::tool_execution_failed))]
    ToolExecutionFailed {
        tool: String,
        error: String,
        #[help]
        help: Option<String>,
    },

    #[error("Run was cancelled")]
    #[diagnostic(code(stagehand::cancelled))]
    Cancelled,

    // ─────────────────────────────────────────────────────────────────────────
    // Artifact Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Artifact '{artifact}' of stage '{stage}' has not been published")]
    #[diagnostic(
        code(stagehand::artifact_missing),
        help("The producing stage must succeed and publish '{artifact}' first")
    )]
    ArtifactMissing { stage: String, artifact: String },

    #[error("Stage '{stage}' cannot publish '{source_path}': source does not exist")]
    #[diagnostic(code(stagehand::artifact_source_missing))]
    ArtifactSourceMissing { stage: String, source_path: String },

    #[error("Invalid artifact rule '{rule}': {reason}")]
    #[diagnostic(
        code(stagehand::invalid_artifact_rule),
        help("Rules look like 'src/path => dest' or 'archive.zip!pattern => dest'")
    )]
    InvalidArtifactRule { rule: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Secret Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Secret '{secret}' not found")]
    #[diagnostic(
        code(stagehand::secret_not_found),
        help("Check that '{secret}' exists in the secret store and is not empty")
    )]
    SecretNotFound { secret: String },

    #[error("Secret '{secret}' could not be decoded: {reason}")]
    #[diagnostic(code(stagehand::secret_decode))]
    SecretDecode { secret: String, reason: String },

    #[error("Secret store error: {message}")]
    #[diagnostic(code(stagehand::secret_store))]
    SecretStore {
        message: String,
        #[help]
        help: Option<String>,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Agent Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("No agent available for stage '{stage}' (requires: {requirements})")]
    #[diagnostic(
        code(stagehand::no_agent_available),
        help("Declare an agent whose capabilities include every required tag")
    )]
    NoAgentAvailable { stage: String, requirements: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(stagehand::pipeline_not_found),
        help("Create .stagehand.yaml or pass --pipeline <FILE>")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(stagehand::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("Stage '{stage}' is invalid: {reason}")]
    #[diagnostic(code(stagehand::invalid_stage))]
    InvalidStage { stage: String, reason: String },

    #[error("Circular dependency detected")]
    #[diagnostic(
        code(stagehand::circular_dependency),
        help("Review your stage dependencies to remove the cycle")
    )]
    CircularDependency { stages: Vec<String> },

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    #[diagnostic(
        code(stagehand::unknown_dependency),
        help("Check that '{dependency}' is defined in your pipeline")
    )]
    UnknownDependency { stage: String, dependency: String },

    #[error("Stage '{stage}' not found in pipeline")]
    #[diagnostic(code(stagehand::stage_not_found))]
    StageNotFound { stage: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Cache Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cache write for '{key}' failed: {message}")]
    #[diagnostic(code(stagehand::cache_write_failure))]
    CacheWriteFailure { key: String, message: String },

    #[error("Cache error: {message}")]
    #[diagnostic(code(stagehand::cache_error))]
    CacheError { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(stagehand::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("Failed to write file '{path}': {error}")]
    #[diagnostic(code(stagehand::file_write_error))]
    FileWriteError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(stagehand::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(stagehand::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(stagehand::json_error))]
    Json { message: String },

    #[error("TOML parsing error: {message}")]
    #[diagnostic(code(stagehand::toml_error))]
    Toml { message: String },

    #[error("Glob pattern error: {message}")]
    #[diagnostic(code(stagehand::glob_error))]
    GlobPattern { message: String },
}

impl From<std::io::Error> for StagehandError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for StagehandError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for StagehandError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<toml::de::Error> for StagehandError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml { message: e.to_string() }
    }
}

impl From<glob::PatternError> for StagehandError {
    fn from(e: glob::PatternError) -> Self {
        Self::GlobPattern { message: e.to_string() }
    }
}

impl StagehandError {
    /// Wrap an IO error with the path it happened on
    pub fn write_failed(path: &std::path::Path, e: std::io::Error) -> Self {
        Self::FileWriteError {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    }

    /// Wrap an IO error with the path it happened on
    pub fn read_failed(path: &std::path::Path, e: std::io::Error) -> Self {
        Self::FileReadError {
            path: path.to_path_buf(),
            error: e.to_string(),
        }
    }

    /// Whether this error belongs to the `SecretNotFound` class
    pub fn is_secret_not_found(&self) -> bool {
        matches!(self, Self::SecretNotFound { .. })
    }
}
