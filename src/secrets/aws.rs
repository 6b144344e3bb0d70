// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! AWS Secrets Manager backend
//!
//! Shells out to `aws secretsmanager get-secret-value`. Credentials, region
//! defaults and transport are the CLI's business.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::debug;

use super::{SecretRecord, SecretStore};
use crate::errors::StagehandError;

/// Secret store backed by the `aws` CLI
pub struct AwsCliSecretStore {
    program: String,
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCliSecretStore {
    pub fn new(region: Option<String>, profile: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region,
            profile,
        }
    }

    /// Use a different executable (a wrapper script, for instance)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, id: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "secretsmanager",
            "get-secret-value",
            "--secret-id",
            id,
            "--output",
            "json",
        ]);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Keep the string-valued fields of a `get-secret-value` response
fn parse_response(id: &str, stdout: &[u8]) -> Result<SecretRecord, StagehandError> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).map_err(|_| StagehandError::SecretStore {
            message: format!("unreadable response for '{}'", id),
            help: None,
        })?;

    let fields = value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    Ok(SecretRecord { fields })
}

/// The CLI reports an unconfigured secret as `ResourceNotFoundException`
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("ResourceNotFoundException")
}

#[async_trait]
impl SecretStore for AwsCliSecretStore {
    async fn fetch(&self, id: &str) -> Result<Option<SecretRecord>, StagehandError> {
        debug!(secret = id, "fetching secret from AWS Secrets Manager");

        let output = self
            .command(id)
            .output()
            .await
            .map_err(|e| StagehandError::SecretStore {
                message: format!("failed to run '{}': {}", self.program, e),
                help: Some("Install the AWS CLI and make sure it is on PATH".into()),
            })?;

        if output.status.success() {
            return parse_response(id, &output.stdout).map(Some);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!(secret = id, "secret not configured");
            return Ok(None);
        }

        Err(StagehandError::SecretStore {
            message: format!(
                "'{}' exited with code {} while fetching '{}': {}",
                self.program,
                output.status.code().unwrap_or(-1),
                id,
                stderr.lines().next().unwrap_or("").trim()
            ),
            help: Some("Check the agent's AWS credentials and region".into()),
        })
    }

    fn name(&self) -> &str {
        "aws-cli"
    }

    async fn check_available(&self) -> Result<bool, StagehandError> {
        Ok(which::which(&self.program).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_keeps_string_fields() {
        let body = br#"{
            "ARN": "arn:aws:secretsmanager:eu-west-1:123:secret:TEAM_ID",
            "Name": "TEAM_ID",
            "VersionStages": ["AWSCURRENT"],
            "SecretString": "{\"TEAM_ID\":\"ABCDE12345\"}"
        }"#;

        let record = parse_response("TEAM_ID", body).unwrap();
        assert_eq!(record.field("Name"), Some("TEAM_ID"));
        assert!(record.field("SecretString").is_some());
        assert!(record.field("VersionStages").is_none());
    }

    #[tokio::test]
    async fn test_missing_program_is_a_store_error() {
        let store = AwsCliSecretStore::new(None, None).with_program("stagehand-no-such-aws");
        let err = store.fetch("TEAM_ID").await.unwrap_err();
        assert!(matches!(err, StagehandError::SecretStore { .. }));
        assert!(!store.check_available().await.unwrap());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(
            "An error occurred (ResourceNotFoundException) when calling the GetSecretValue operation"
        ));
        assert!(!is_not_found("An error occurred (AccessDeniedException)"));
    }
}
