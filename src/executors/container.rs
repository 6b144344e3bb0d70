// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Container executor
//!
//! Runs a step inside a container image through the `docker` CLI. The stage
//! workspace and any extra mounts appear inside the container at the same
//! paths they have on the agent, so file-bound secrets keep working.
//!
//! Every container gets a unique name. Killing the CLI client on cancellation
//! does not stop the container, so cancellation also runs `<cli> kill <name>`.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{run_command, ExecutionResult, Executor, StepContext};
use crate::cache::unique_token;
use crate::errors::StagehandError;
use crate::pipeline::{Environment, Step};

/// Container executor
pub struct ContainerExecutor {
    program: String,
}

impl ContainerExecutor {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    /// Use another docker-compatible CLI, e.g. `podman`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Container name for one execution of a step in `stage`
    pub fn container_name(stage: &str) -> String {
        let stage: String = stage
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("stagehand-{}-{}", stage, &unique_token()[..12])
    }

    /// Arguments passed to the container CLI for one step
    pub fn build_args(
        &self,
        step: &Step,
        ctx: &StepContext<'_>,
        name: &str,
    ) -> Result<Vec<String>, StagehandError> {
        let Environment::Container { image, platform } = &step.environment else {
            return Err(StagehandError::InvalidStage {
                stage: ctx.stage.to_string(),
                reason: format!("step '{}' is not a container step", step.name),
            });
        };

        let workdir = path_arg(ctx.working_dir);
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--init".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{}", workdir, workdir),
            "-w".to_string(),
            workdir,
        ];

        for mount in ctx.mounts {
            let mount = path_arg(mount);
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", mount, mount));
        }

        // Values stay in the client's environment, off the command line
        let mut keys: Vec<&String> = ctx.env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        // A bare OS name like `linux` is not a docker platform
        if let Some(platform) = platform.as_deref().filter(|p| p.contains('/')) {
            args.push("--platform".to_string());
            args.push(platform.to_string());
        }

        args.push(image.clone());
        args.push(step.shell.clone());
        args.push("-c".to_string());
        args.push(step.command.clone());

        Ok(args)
    }

    /// Stop a container whose client was cancelled
    async fn kill_container(&self, name: &str) {
        let mut cmd = Command::new(&self.program);
        cmd.args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(KILL_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => debug!(container = name, "killed container"),
            // Not running any more, or never started
            Ok(Ok(_)) => debug!(container = name, "container already gone"),
            Ok(Err(e)) => warn!(container = name, error = %e, "failed to kill container"),
            Err(_) => warn!(container = name, "timed out killing container"),
        }
    }
}

const KILL_TIMEOUT: Duration = Duration::from_secs(30);

impl Default for ContainerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn path_arg(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn execute(
        &self,
        step: &Step,
        ctx: &StepContext<'_>,
    ) -> Result<ExecutionResult, StagehandError> {
        self.validate_step(step)?;
        let name = Self::container_name(ctx.stage);
        let args = self.build_args(step, ctx, &name)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        cmd.current_dir(ctx.working_dir);
        cmd.envs(ctx.env);

        let result = run_command(cmd, &self.program, ctx.cancel).await;
        if matches!(result, Err(StagehandError::Cancelled)) {
            self.kill_container(&name).await;
        }
        result
    }

    async fn check_available(&self) -> Result<bool, StagehandError> {
        Ok(which::which(&self.program).is_ok())
    }

    fn validate_step(&self, step: &Step) -> Result<(), StagehandError> {
        let Environment::Container { image, .. } = &step.environment else {
            return Err(StagehandError::InvalidStage {
                stage: step.name.clone(),
                reason: "Not a container step".to_string(),
            });
        };

        if image.trim().is_empty() {
            return Err(StagehandError::InvalidStage {
                stage: step.name.clone(),
                reason: "Container image is empty".to_string(),
            });
        }

        if step.command.trim().is_empty() {
            return Err(StagehandError::InvalidStage {
                stage: step.name.clone(),
                reason: "Command is empty".to_string(),
            });
        }

        Ok(())
    }
}
