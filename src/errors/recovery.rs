// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Error recovery suggestions
//!
//! Turns a failed stage into actionable next steps for the `run` command.

use crate::pipeline::FailureReason;

/// A recovery suggestion with concrete steps
#[derive(Debug, Clone)]
pub struct RecoverySuggestion {
    /// Brief description of what to do
    pub action: String,
    /// Detailed steps
    pub steps: Vec<String>,
    /// Commands to run
    pub commands: Vec<String>,
}

impl RecoverySuggestion {
    /// Suggest a fix for a failed stage
    pub fn for_failure(stage: &str, reason: &FailureReason) -> Self {
        match reason {
            FailureReason::StepFailure { step, exit_code } => Self {
                action: format!("Fix step '{}' in stage '{}'", step, stage),
                steps: vec![
                    format!("The step exited with code {}", exit_code),
                    "Later steps were not run and dependent stages were skipped".into(),
                    "Steps are never retried; re-run the pipeline once fixed".into(),
                ],
                commands: vec![
                    "# Re-run only this stage:".into(),
                    format!("stagehand run --stage {}", stage),
                ],
            },
            FailureReason::ArtifactMissing { artifact } => Self {
                action: format!("Publish artifact '{}' before stage '{}'", artifact, stage),
                steps: vec![
                    "The upstream stage must succeed and publish the artifact".into(),
                    "Check the upstream stage's artifact rules for the destination name".into(),
                ],
                commands: vec![
                    "# Show stage ordering:".into(),
                    "stagehand graph".into(),
                ],
            },
            FailureReason::ArtifactPublish { source_path } => Self {
                action: format!("Produce '{}' in stage '{}'", source_path, stage),
                steps: vec![
                    "A publish rule's source did not exist when the stage finished".into(),
                    "Either the build output moved or the rule's source path is wrong".into(),
                ],
                commands: vec![],
            },
            FailureReason::SecretNotFound { secret } => Self {
                action: format!("Provide secret '{}'", secret),
                steps: vec![
                    "The secret store returned nothing for this id".into(),
                    "Signed packaging requires every signing secret to be present".into(),
                ],
                commands: vec![
                    "# Check the secret exists (AWS Secrets Manager):".into(),
                    format!("aws secretsmanager describe-secret --secret-id {}", secret),
                ],
            },
            FailureReason::NoAgentAvailable { requirements } => Self {
                action: format!("Provide an agent for stage '{}'", stage),
                steps: vec![
                    format!("Required capabilities: {}", requirements.join(", ")),
                    "Add an agent with these capabilities or raise timeouts.agent_queue_secs"
                        .into(),
                ],
                commands: vec![],
            },
            FailureReason::Error { message } => Self {
                action: format!("Resolve the error in stage '{}'", stage),
                steps: vec![message.clone()],
                commands: vec![],
            },
        }
    }

    /// Suggest fixing a circular dependency
    pub fn fix_circular_dependency(stages: &[String]) -> Self {
        Self {
            action: "Remove circular dependency".into(),
            steps: vec![
                format!("Detected cycle: {}", stages.join(" → ")),
                "Review your stage dependencies".into(),
                "Ensure stages form a directed acyclic graph (DAG)".into(),
            ],
            commands: vec![
                "# Visualize your pipeline:".into(),
                "stagehand graph --format mermaid".into(),
            ],
        }
    }
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "→ {}", self.action)?;

        for step in &self.steps {
            writeln!(f, "  {}", step)?;
        }

        if !self.commands.is_empty() {
            writeln!(f)?;
            for cmd in &self.commands {
                writeln!(f, "  {}", cmd)?;
            }
        }

        Ok(())
    }
}
