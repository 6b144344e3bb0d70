// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Step executors
//!
//! This module provides the executor trait and implementations
//! for the places a step can run (the agent host, a container).

mod container;
mod shell;

pub use container::ContainerExecutor;
pub use shell::ShellExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::errors::StagehandError;
use crate::pipeline::{CancelToken, Environment, Step};

/// Result of step execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether execution succeeded
    pub success: bool,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Exit code
    pub exit_code: i32,

    /// Execution duration
    pub duration: Duration,
}

impl ExecutionResult {
    /// Combined output, stdout first
    pub fn output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Everything a step needs besides its own definition
pub struct StepContext<'a> {
    pub stage: &'a str,
    pub working_dir: &'a Path,
    /// Fully merged environment, secrets included
    pub env: &'a HashMap<String, String>,
    /// Extra host directories the step must see at the same path
    pub mounts: &'a [PathBuf],
    pub cancel: &'a CancelToken,
}

/// Trait for step executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute a step
    ///
    /// A non-zero exit is reported in the result, not as an error. Errors are
    /// reserved for steps that could not be started or were cancelled.
    async fn execute(
        &self,
        step: &Step,
        ctx: &StepContext<'_>,
    ) -> Result<ExecutionResult, StagehandError>;

    /// Check if the backing tool is available
    async fn check_available(&self) -> Result<bool, StagehandError>;

    /// Validate step configuration
    fn validate_step(&self, step: &Step) -> Result<(), StagehandError>;
}

/// Run a prepared command to completion, killing it if the run is cancelled
pub(crate) async fn run_command(
    mut cmd: Command,
    tool: &str,
    cancel: &CancelToken,
) -> Result<ExecutionResult, StagehandError> {
    if cancel.is_cancelled() {
        return Err(StagehandError::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let child = cmd.spawn().map_err(|e| StagehandError::ToolExecutionFailed {
        tool: tool.to_string(),
        error: e.to_string(),
        help: Some(format!("'{}' may not be installed on this agent", tool)),
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = cancel.cancelled() => return Err(StagehandError::Cancelled),
    };

    let exit_code = output.status.code().unwrap_or(-1);
    Ok(ExecutionResult {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code,
        duration: start.elapsed(),
    })
}

/// Registry key of the executor that runs steps in `environment`
pub fn executor_key(environment: &Environment) -> &'static str {
    match environment {
        Environment::Host => "host",
        Environment::Container { .. } => "container",
    }
}

/// Create a standard executor setup with all built-in executors
pub fn create_default_executors() -> HashMap<String, Box<dyn Executor>> {
    let mut executors: HashMap<String, Box<dyn Executor>> = HashMap::new();

    executors.insert("host".to_string(), Box::new(ShellExecutor::new()));
    executors.insert("container".to_string(), Box::new(ContainerExecutor::new()));

    executors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_keys() {
        let executors = create_default_executors();
        assert!(executors.contains_key(executor_key(&Environment::Host)));
        assert!(executors.contains_key(executor_key(&Environment::Container {
            image: "alpine".into(),
            platform: None,
        })));
    }

    #[test]
    fn test_combined_output() {
        let result = ExecutionResult {
            success: false,
            stdout: "building".into(),
            stderr: "error: missing scheme".into(),
            exit_code: 65,
            duration: Duration::ZERO,
        };
        assert_eq!(result.output(), "building\nerror: missing scheme");
    }
}
