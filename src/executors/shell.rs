// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Shell executor
//!
//! Executes step commands directly on the agent.

use async_trait::async_trait;
use tokio::process::Command;

use super::{run_command, ExecutionResult, Executor, StepContext};
use crate::errors::StagehandError;
use crate::pipeline::{Environment, Step};

/// Shell executor
pub struct ShellExecutor;

impl ShellExecutor {
    /// Create a new shell executor
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(
        &self,
        step: &Step,
        ctx: &StepContext<'_>,
    ) -> Result<ExecutionResult, StagehandError> {
        self.validate_step(step)?;

        let mut cmd = Command::new(&step.shell);
        cmd.arg("-c").arg(&step.command);
        cmd.current_dir(ctx.working_dir);
        cmd.envs(ctx.env);

        run_command(cmd, &step.shell, ctx.cancel).await
    }

    async fn check_available(&self) -> Result<bool, StagehandError> {
        // Shell is always available (we assume basic shell exists)
        Ok(true)
    }

    fn validate_step(&self, step: &Step) -> Result<(), StagehandError> {
        if step.environment != Environment::Host {
            return Err(StagehandError::InvalidStage {
                stage: step.name.clone(),
                reason: "Not a host step".to_string(),
            });
        }

        if step.command.trim().is_empty() {
            return Err(StagehandError::InvalidStage {
                stage: step.name.clone(),
                reason: "Shell command is empty".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{cancel_pair, CancelToken};
    use std::collections::HashMap;
    use std::time::Duration;

    fn make_step(command: &str) -> Step {
        serde_yaml::from_value(serde_yaml::Value::Mapping(
            [
                ("name".into(), "test".into()),
                ("command".into(), command.into()),
                ("shell".into(), "sh".into()),
            ]
            .into_iter()
            .collect(),
        ))
        .unwrap()
    }

    #[test]
    fn test_validate_empty_command_fails() {
        let executor = ShellExecutor::new();
        assert!(executor.validate_step(&make_step("echo hello")).is_ok());
        assert!(executor.validate_step(&make_step("  ")).is_err());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
        let cancel = CancelToken::never();
        let ctx = StepContext {
            stage: "build",
            working_dir: dir.path(),
            env: &env,
            mounts: &[],
            cancel: &cancel,
        };

        let result = ShellExecutor::new()
            .execute(&make_step("echo $GREETING; pwd"), &ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::new();
        let cancel = CancelToken::never();
        let ctx = StepContext {
            stage: "build",
            working_dir: dir.path(),
            env: &env,
            mounts: &[],
            cancel: &cancel,
        };

        let result = ShellExecutor::new()
            .execute(&make_step("echo oops >&2; exit 3"), &ctx)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_step() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::new();
        let (handle, cancel) = cancel_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let ctx = StepContext {
            stage: "build",
            working_dir: dir.path(),
            env: &env,
            mounts: &[],
            cancel: &cancel,
        };
        let started = std::time::Instant::now();
        let err = ShellExecutor::new()
            .execute(&make_step("sleep 30"), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, StagehandError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        canceller.await.unwrap();
    }
}
