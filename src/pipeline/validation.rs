// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Pipeline validation
//!
//! Validates pipeline configuration before execution.

use std::collections::HashSet;
use std::path::{Component, Path};

use crate::agents::AgentPool;
use crate::artifacts::RuleSource;
use crate::errors::StagehandError;
use crate::pipeline::{DagBuilder, Environment, Pipeline, SecretStoreConfig, Stage, Step};

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a pipeline configuration
    pub fn validate(pipeline: &Pipeline) -> Result<ValidationResult, StagehandError> {
        let mut result = ValidationResult::new();

        if pipeline.id.trim().is_empty() {
            result.add_error("Pipeline id is empty");
        }

        // Check for empty stages
        if pipeline.stages.is_empty() {
            result.add_error("Pipeline has no stages defined");
        }

        // Check for duplicate stage ids
        let mut seen_ids = HashSet::new();
        for stage in &pipeline.stages {
            if !seen_ids.insert(&stage.id) {
                result.add_error(&format!("Duplicate stage id: '{}'", stage.id));
            }
        }

        // Validate DAG structure (checks for cycles and unknown dependencies)
        match DagBuilder::build(pipeline) {
            Ok(_) => {}
            Err(StagehandError::CircularDependency { stages }) => {
                result.add_error(&format!("Circular dependency: {}", stages.join(" → ")));
            }
            Err(StagehandError::UnknownDependency { stage, dependency }) => {
                result.add_error(&format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    stage, dependency
                ));
            }
            Err(e) => {
                result.add_error(&format!("DAG validation error: {}", e));
            }
        }

        let local = pipeline.agents.is_empty().then(AgentPool::local);

        // Validate each stage
        for stage in &pipeline.stages {
            Self::validate_stage(stage, pipeline, local.as_ref(), &mut result);
        }

        Ok(result)
    }

    /// Validate a single stage
    fn validate_stage(
        stage: &Stage,
        pipeline: &Pipeline,
        local: Option<&AgentPool>,
        result: &mut ValidationResult,
    ) {
        if stage.steps.is_empty() && stage.packaging.is_none() {
            result.add_warning(&format!("Stage '{}': has no steps", stage.id));
        }

        for step in stage.all_steps() {
            Self::validate_step(stage, step, pipeline, result);
        }

        if let Some(packaging) = &stage.packaging {
            if packaging.signed.is_empty() && packaging.unsigned.is_empty() {
                result.add_warning(&format!(
                    "Stage '{}': packaging defines neither signed nor unsigned steps",
                    stage.id
                ));
            }
        }

        // Agent requirements
        match local {
            None => {
                if !pipeline.agents.iter().any(|a| a.satisfies(&stage.requirements)) {
                    result.add_error(&format!(
                        "Stage '{}': no declared agent provides [{}]",
                        stage.id,
                        stage.requirements.join(", ")
                    ));
                }
            }
            Some(pool) => {
                if !pool.could_satisfy(&stage.requirements) {
                    result.add_warning(&format!(
                        "Stage '{}': this machine does not provide [{}]",
                        stage.id,
                        stage.requirements.join(", ")
                    ));
                }
            }
        }

        // Publish rules take workspace paths
        for rule in &stage.artifacts {
            if !rule.is_publishable() {
                result.add_error(&format!(
                    "Stage '{}': publish rule '{}' reads from an archive",
                    stage.id, rule
                ));
            }
        }

        // Consumed artifacts must be published upstream
        for dependency in &stage.dependencies {
            let Some(upstream) = pipeline.get_stage(&dependency.stage) else {
                continue;
            };
            let published: HashSet<String> = upstream
                .artifacts
                .iter()
                .map(|r| r.publish_target().0)
                .collect();

            for rule in &dependency.artifacts {
                let artifact = rule.consumed_artifact();
                if !published.contains(&artifact) {
                    result.add_error(&format!(
                        "Stage '{}': consumes '{}' but stage '{}' publishes no such artifact",
                        stage.id, artifact, upstream.id
                    ));
                }
                if matches!(rule.source(), RuleSource::Path(p) if p.contains('/')) {
                    result.add_warning(&format!(
                        "Stage '{}': rule '{}' names a path, use 'artifact!pattern' to pick files",
                        stage.id, rule
                    ));
                }
            }
        }

        // Cache rules
        let mut cache_names = HashSet::new();
        for rule in &stage.cache {
            if rule.name.trim().is_empty() {
                result.add_error(&format!("Stage '{}': cache rule without a name", stage.id));
            } else if !cache_names.insert(&rule.name) {
                result.add_error(&format!(
                    "Stage '{}': duplicate cache rule '{}'",
                    stage.id, rule.name
                ));
            }

            let escapes = rule
                .path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                result.add_error(&format!(
                    "Stage '{}': cache path '{}' must stay inside the workspace",
                    stage.id,
                    rule.path.display()
                ));
            }
        }
    }

    fn validate_step(stage: &Stage, step: &Step, pipeline: &Pipeline, result: &mut ValidationResult) {
        if step.command.trim().is_empty() {
            result.add_error(&format!(
                "Stage '{}': step '{}' has an empty command",
                stage.id, step.name
            ));
        }

        if let Environment::Container { image, platform } = &step.environment {
            if image.trim().is_empty() {
                result.add_error(&format!(
                    "Stage '{}': step '{}' has an empty container image",
                    stage.id, step.name
                ));
            }
            if let Some(platform) = platform.as_deref().filter(|p| !p.contains('/')) {
                result.add_warning(&format!(
                    "Stage '{}': step '{}' platform '{}' is not os/arch and is ignored",
                    stage.id, step.name, platform
                ));
            }
        }

        for binding in &step.secrets {
            if binding.env.is_none() && binding.file.is_none() {
                result.add_error(&format!(
                    "Stage '{}': step '{}' binds secret '{}' to neither env nor file",
                    stage.id, step.name, binding.secret
                ));
            }
            if !pipeline.secrets.contains_key(&binding.secret) {
                result.add_warning(&format!(
                    "Secret '{}' has no declared mode, decoding as text",
                    binding.secret
                ));
            }
        }
    }

    /// Check that required files exist (runtime validation)
    pub fn validate_files(
        pipeline: &Pipeline,
        base_path: &Path,
    ) -> Result<Vec<String>, StagehandError> {
        let mut missing = Vec::new();

        if let SecretStoreConfig::File { path } = &pipeline.secret_store {
            if !base_path.join(path).exists() {
                missing.push(format!("Secret file not found: {}", path.display()));
            }
        }

        Ok(missing)
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        if !self.warnings.iter().any(|w| w == message) {
            self.warnings.push(message.to_string());
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(yaml: &str) -> ValidationResult {
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        PipelineValidator::validate(&pipeline).unwrap()
    }

    #[test]
    fn test_sample_pipeline_is_valid() {
        let result = validate(include_str!("../../pipelines/unity-ios.yaml"));
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.contains("platform 'linux'")));
    }

    #[test]
    fn test_validate_empty_pipeline() {
        let result = validate("id: empty\nstages: []\n");
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("no stages"));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let result = validate(
            r#"
id: test
stages:
  - id: dup
    steps: [{ name: a, command: "true" }]
  - id: dup
    steps: [{ name: b, command: "true" }]
"#,
        );
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn test_consumed_artifact_must_be_published() {
        let result = validate(
            r#"
id: test
stages:
  - id: first
    steps: [{ name: a, command: "true" }]
    artifacts: ["out => Logs.zip"]
  - id: second
    steps: [{ name: b, command: "true" }]
    dependencies:
      - stage: first
        artifacts: ["Project.zip!** => ."]
"#,
        );
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("'Project.zip'")));
    }

    #[test]
    fn test_step_checks() {
        let result = validate(
            r#"
id: test
agents:
  - name: builder
    capabilities: [linux]
stages:
  - id: build
    requirements: [macos]
    artifacts: ["Project.zip!** => out"]
    steps:
      - name: empty
        command: "  "
      - name: bound
        command: "true"
        secrets:
          - secret: TOKEN
"#,
        );
        let errors = result.errors.join("\n");
        assert!(errors.contains("empty command"));
        assert!(errors.contains("neither env nor file"));
        assert!(errors.contains("no declared agent provides [macos]"));
        assert!(errors.contains("reads from an archive"));
        assert!(result.warnings.iter().any(|w| w.contains("'TOKEN'")));
    }

    #[test]
    fn test_cache_path_must_stay_in_workspace() {
        let result = validate(
            r#"
id: test
stages:
  - id: build
    steps: [{ name: a, command: "true" }]
    cache:
      - { name: deps, path: ../outside }
"#,
        );
        assert!(result.errors.iter().any(|e| e.contains("inside the workspace")));
    }

    #[test]
    fn test_missing_secret_file_reported() {
        let pipeline = Pipeline::from_yaml(
            "id: t\nsecret_store: { kind: file, path: secrets.yaml }\nstages: []\n",
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let missing = PipelineValidator::validate_files(&pipeline, dir.path()).unwrap();
        assert_eq!(missing.len(), 1);
    }
}
