// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Pipeline definition structures
//!
//! Defines the schema for .stagehand.yaml (or .toml) files. Everything here is
//! plain data: a loaded pipeline is shared behind an `Arc` and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agents::Agent;
use crate::artifacts::ArtifactRule;
use crate::errors::StagehandError;
use crate::secrets::DecodeMode;

/// Pipeline definition from .stagehand.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline version (for future compatibility)
    #[serde(default = "default_version")]
    pub version: String,

    /// Stable pipeline identifier, part of every cache key
    pub id: String,

    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Pipeline description
    #[serde(default)]
    pub description: Option<String>,

    /// Stages in declaration order
    pub stages: Vec<Stage>,

    /// Global environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Pipeline parameters threaded into every run
    #[serde(default)]
    pub params: Params,

    /// Execution agents available to this pipeline
    #[serde(default)]
    pub agents: Vec<Agent>,

    /// Decode modes for secrets, keyed by secret id
    #[serde(default)]
    pub secrets: BTreeMap<String, DecodeMode>,

    /// Where secrets are fetched from
    #[serde(default)]
    pub secret_store: SecretStoreConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Artifact store configuration
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Wait bounds
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_version() -> String {
    "1".to_string()
}

impl Pipeline {
    /// Load pipeline from a YAML or TOML file
    pub fn from_file(path: &Path) -> Result<Self, StagehandError> {
        if !path.exists() {
            return Err(StagehandError::PipelineNotFound {
                path: path.to_path_buf(),
            });
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| StagehandError::read_failed(path, e))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("yaml") | Some("yml") | None => Self::from_yaml(&content),
            Some(other) => Err(StagehandError::InvalidPipeline {
                reason: format!("unsupported pipeline file extension '.{}'", other),
                help: Some("Use a .yaml, .yml or .toml file".into()),
            }),
        }
    }

    /// Parse pipeline from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, StagehandError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Parse pipeline from TOML string
    pub fn from_toml(source: &str) -> Result<Self, StagehandError> {
        toml::from_str(source).map_err(Into::into)
    }

    /// Serialize pipeline to YAML
    pub fn to_yaml(&self) -> Result<String, StagehandError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Name for display, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Get a stage by id
    pub fn get_stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Get all stage ids in declaration order
    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id.as_str()).collect()
    }

    /// Decode mode declared for a secret, `Text` of `SecretString` otherwise
    pub fn decode_mode(&self, secret: &str) -> DecodeMode {
        self.secrets.get(secret).cloned().unwrap_or_default()
    }
}

/// Parameters shared by every stage of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Params {
    /// Code signing identity handed to signed packaging steps
    #[serde(default)]
    pub code_sign_identity: Option<String>,

    /// Free-form parameters, exposed to steps as `STAGEHAND_PARAM_<NAME>`
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// A single pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage id (must be unique within pipeline)
    pub id: String,

    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,

    /// Stage description
    #[serde(default)]
    pub description: Option<String>,

    /// Steps, executed strictly in this order
    pub steps: Vec<Step>,

    /// Capability tags an agent must carry to run this stage
    #[serde(default)]
    pub requirements: Vec<String>,

    /// Publish rules, applied after every step succeeded
    #[serde(default)]
    pub artifacts: Vec<ArtifactRule>,

    /// Upstream stages and the artifacts consumed from them
    #[serde(default)]
    pub dependencies: Vec<Dependency>,

    /// What starts this stage
    #[serde(default)]
    pub trigger: Trigger,

    /// Workspace paths persisted across runs
    #[serde(default)]
    pub cache: Vec<CacheRule>,

    /// Environment variables for this stage
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Workspace directory relative to the run's workspace root (defaults to the id)
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    /// Signed/unsigned packaging branch, run after `steps`
    #[serde(default)]
    pub packaging: Option<Packaging>,
}

impl Stage {
    /// Name for display, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Ids of the stages this one depends on
    pub fn upstream_ids(&self) -> Vec<&str> {
        self.dependencies.iter().map(|d| d.stage.as_str()).collect()
    }

    /// Workspace directory for this stage under `root`
    pub fn workspace_dir(&self, root: &Path) -> PathBuf {
        match &self.workspace {
            Some(dir) => root.join(dir),
            None => root.join(&self.id),
        }
    }

    /// All steps this stage could run, including both packaging branches
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        let branch = self
            .packaging
            .iter()
            .flat_map(|p| p.signed.iter().chain(p.unsigned.iter()));
        self.steps.iter().chain(branch)
    }
}

/// Dependency edge: this stage consumes artifacts from `stage`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    /// Upstream stage id
    pub stage: String,

    /// Consume rules, e.g. `XcodeProject.zip!** => .`
    #[serde(default)]
    pub artifacts: Vec<ArtifactRule>,
}

/// What starts a stage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Successful completion of upstream stages (or a manual run)
    #[default]
    Dependency,
    /// An external change event touching one of these paths
    Change { paths: Vec<String> },
}

impl Trigger {
    /// Whether a change to `path` fires this trigger
    pub fn matches_change(&self, path: &str) -> bool {
        match self {
            Self::Dependency => false,
            Self::Change { paths } => paths.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(path))
                    .unwrap_or(false)
            }),
        }
    }
}

/// A single step within a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name
    pub name: String,

    /// Script passed to the shell
    pub command: String,

    /// Shell to use (bash, sh, etc.)
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Where the command runs
    #[serde(default)]
    pub environment: Environment,

    /// Environment variables for this step
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Secrets resolved before the step runs
    #[serde(default)]
    pub secrets: Vec<SecretBinding>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Execution environment of a step
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Directly on the agent
    #[default]
    Host,
    /// Inside a container image
    Container {
        image: String,
        #[serde(default)]
        platform: Option<String>,
    },
}

/// How a secret reaches a step: as a variable, as a file, or both
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretBinding {
    /// Secret id in the store
    pub secret: String,

    /// Expose the decoded value in this environment variable
    #[serde(default)]
    pub env: Option<String>,

    /// Write the decoded value to a run-local file and put its path in this variable
    #[serde(default)]
    pub file: Option<String>,
}

/// Signed/unsigned packaging branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packaging {
    /// Secret whose presence selects the signed path
    #[serde(default = "default_profile_secret")]
    pub profile_secret: String,

    #[serde(default = "default_team_id_secret")]
    pub team_id_secret: String,

    #[serde(default = "default_bundle_id_secret")]
    pub bundle_id_secret: String,

    #[serde(default = "default_passphrase_secret")]
    pub passphrase_secret: String,

    /// Steps run when the profile is present
    pub signed: Vec<Step>,

    /// Steps run when the profile is absent
    pub unsigned: Vec<Step>,
}

fn default_profile_secret() -> String {
    "PROVISIONING_PROFILE".to_string()
}

fn default_team_id_secret() -> String {
    "TEAM_ID".to_string()
}

fn default_bundle_id_secret() -> String {
    "APP_BUNDLE".to_string()
}

fn default_passphrase_secret() -> String {
    "SIGNING_CERT_PRIV_KEY_PASSPHRASE".to_string()
}

impl Packaging {
    /// Ids of the three secrets fetched from the store on the signed path
    pub fn signing_secret_ids(&self) -> [&str; 3] {
        [
            self.team_id_secret.as_str(),
            self.bundle_id_secret.as_str(),
            self.passphrase_secret.as_str(),
        ]
    }
}

/// A workspace path persisted and restored across runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRule {
    /// Rule name, part of the cache key
    pub name: String,

    /// Workspace-relative path
    pub path: PathBuf,

    /// Store a snapshot after the stage succeeds
    #[serde(default = "default_true")]
    pub publish: bool,

    /// Restore the snapshot before the stage runs
    #[serde(default = "default_true", rename = "use")]
    pub use_cache: bool,
}

/// Where secrets come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SecretStoreConfig {
    /// AWS Secrets Manager through the `aws` CLI
    AwsCli {
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        profile: Option<String>,
    },
    /// A local YAML file mapping secret ids to fields
    File { path: PathBuf },
}

impl Default for SecretStoreConfig {
    fn default() -> Self {
        Self::AwsCli {
            region: None,
            profile: None,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable caching
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory (defaults to the per-user data directory)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Snapshots kept per key
    #[serde(default = "default_retain")]
    pub retain: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            retain: default_retain(),
        }
    }
}

impl CacheConfig {
    /// Resolve the cache directory, relative paths taken from `base_dir`
    pub fn resolve_directory(&self, base_dir: &Path) -> PathBuf {
        match &self.directory {
            Some(dir) => base_dir.join(dir),
            None => directories::ProjectDirs::from("dev", "stagehand", "stagehand")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| base_dir.join(".stagehand").join("cache")),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retain() -> usize {
    2
}

/// Artifact store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Root of the artifact store
    #[serde(default = "default_artifact_dir")]
    pub directory: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            directory: default_artifact_dir(),
        }
    }
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".stagehand/artifacts")
}

/// Bounded waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// How long a stage waits for a consumed artifact to appear
    #[serde(default = "default_artifact_wait")]
    pub artifact_wait_secs: u64,

    /// How long a stage stays queued waiting for an agent
    #[serde(default = "default_agent_queue")]
    pub agent_queue_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            artifact_wait_secs: default_artifact_wait(),
            agent_queue_secs: default_agent_queue(),
        }
    }
}

impl Timeouts {
    pub fn artifact_wait(&self) -> Duration {
        Duration::from_secs(self.artifact_wait_secs)
    }

    pub fn agent_queue(&self) -> Duration {
        Duration::from_secs(self.agent_queue_secs)
    }
}

fn default_artifact_wait() -> u64 {
    60
}

fn default_agent_queue() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNITY_IOS: &str = include_str!("../../pipelines/unity-ios.yaml");

    #[test]
    fn test_parse_simple_pipeline() {
        let yaml = r#"
id: "hello"
stages:
  - id: "build"
    steps:
      - name: "say hello"
        command: "echo hello"
"#;

        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        assert_eq!(pipeline.id, "hello");
        assert_eq!(pipeline.display_name(), "hello");
        assert_eq!(pipeline.stages.len(), 1);
        assert_eq!(pipeline.stages[0].steps[0].shell, "bash");
        assert_eq!(pipeline.stages[0].trigger, Trigger::Dependency);
        assert!(pipeline.cache.enabled);
    }

    #[test]
    fn test_parse_two_stage_ios_pipeline() {
        let pipeline = Pipeline::from_yaml(UNITY_IOS).unwrap();
        assert_eq!(pipeline.stage_ids(), vec!["build-unity-project", "build-ios-app"]);
        assert_eq!(
            pipeline.params.code_sign_identity.as_deref(),
            Some("Apple Distribution")
        );

        let engine = pipeline.get_stage("build-unity-project").unwrap();
        assert_eq!(engine.requirements, vec!["name:Linux-XLarge"]);
        assert_eq!(engine.cache[0].name, "UnityPackages");
        assert!(engine.cache[0].publish && engine.cache[0].use_cache);
        assert!(matches!(
            engine.steps[2].environment,
            Environment::Container { .. }
        ));

        let app = pipeline.get_stage("build-ios-app").unwrap();
        assert_eq!(app.upstream_ids(), vec!["build-unity-project"]);
        assert_eq!(app.env.get("LANG").map(String::as_str), Some("en_US.UTF-8"));
        assert!(matches!(app.trigger, Trigger::Change { .. }));

        let packaging = app.packaging.as_ref().unwrap();
        assert_eq!(packaging.profile_secret, "PROVISIONING_PROFILE");
        assert_eq!(packaging.signed.len(), 2);
        assert_eq!(packaging.signed[0].secrets.len(), 2);
        assert!(pipeline.stages[1].steps.iter().all(|s| s.secrets.is_empty()));
        assert_eq!(packaging.unsigned.len(), 1);
        assert!(matches!(
            pipeline.decode_mode("PROVISIONING_PROFILE"),
            DecodeMode::Base64 { .. }
        ));
    }

    #[test]
    fn test_parse_toml_pipeline() {
        let source = r#"
id = "toml-pipeline"

[params]
code_sign_identity = "Apple Development"
channel = "beta"

[[stages]]
id = "build"

[[stages.steps]]
name = "compile"
command = "make"
"#;

        let pipeline = Pipeline::from_toml(source).unwrap();
        assert_eq!(pipeline.id, "toml-pipeline");
        assert_eq!(pipeline.params.extra.get("channel").map(String::as_str), Some("beta"));
    }

    #[test]
    fn test_invalid_artifact_rule_rejected_at_load() {
        let yaml = r#"
id: "bad"
stages:
  - id: "build"
    steps: []
    artifacts:
      - "no arrow here"
"#;

        assert!(Pipeline::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_change_trigger_matches_globs() {
        let trigger = Trigger::Change {
            paths: vec!["fastlane/**".into()],
        };
        assert!(trigger.matches_change("fastlane/Fastfile"));
        assert!(!trigger.matches_change("Assets/Editor/ExportTool.cs"));
        assert!(!Trigger::Dependency.matches_change("fastlane/Fastfile"));
    }

    #[test]
    fn test_round_trip_yaml() {
        let pipeline = Pipeline::from_yaml(UNITY_IOS).unwrap();
        let yaml = pipeline.to_yaml().unwrap();
        let parsed = Pipeline::from_yaml(&yaml).unwrap();

        assert_eq!(parsed.id, pipeline.id);
        assert_eq!(parsed.stages.len(), pipeline.stages.len());
        assert_eq!(
            parsed.stages[1].dependencies[0].artifacts,
            pipeline.stages[1].dependencies[0].artifacts
        );
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("pipeline.json");
        std::fs::write(&path, "{}").unwrap();

        let err = Pipeline::from_file(&path).unwrap_err();
        assert!(matches!(err, StagehandError::InvalidPipeline { .. }));

        let missing = Pipeline::from_file(&temp_dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(missing, StagehandError::PipelineNotFound { .. }));
    }
}
