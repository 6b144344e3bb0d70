// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Stage execution
//!
//! Runs the steps of one stage strictly in order on an assigned agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::agents::Agent;
use crate::errors::{StagehandError, StagehandResult};
use crate::executors::{executor_key, Executor, StepContext};
use crate::pipeline::{CancelToken, Pipeline, Stage, StageReport, Step, StepReport};
use crate::secrets::SecretResolver;

/// Runs steps of a single stage
pub struct StageExecutor<'a> {
    stage: &'a Stage,
    executors: &'a HashMap<String, Box<dyn Executor>>,
    secrets: &'a SecretResolver,
    cancel: &'a CancelToken,
    working_dir: PathBuf,
    base_env: HashMap<String, String>,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        stage: &'a Stage,
        executors: &'a HashMap<String, Box<dyn Executor>>,
        secrets: &'a SecretResolver,
        cancel: &'a CancelToken,
        working_dir: PathBuf,
        base_env: HashMap<String, String>,
    ) -> Self {
        Self {
            stage,
            executors,
            secrets,
            cancel,
            working_dir,
            base_env,
        }
    }

    /// Run `steps` in order, stopping at the first failure
    ///
    /// `extra_env` sits just below secret bindings; signed packaging passes its
    /// identity this way. Every step that starts is recorded on `report`.
    pub async fn run_steps(
        &self,
        steps: &[Step],
        extra_env: &[(String, String)],
        report: &mut StageReport,
    ) -> StagehandResult<()> {
        for step in steps {
            if self.cancel.is_cancelled() {
                return Err(StagehandError::Cancelled);
            }
            self.run_step(step, extra_env, report).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &Step,
        extra_env: &[(String, String)],
        report: &mut StageReport,
    ) -> StagehandResult<()> {
        let stage = self.stage.id.as_str();

        let executor = self
            .executors
            .get(executor_key(&step.environment))
            .ok_or_else(|| StagehandError::ToolExecutionFailed {
                tool: executor_key(&step.environment).to_string(),
                error: "no executor registered".into(),
                help: None,
            })?;

        let mut env = self.base_env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(extra_env.iter().cloned());

        let mut needs_scope = !extra_env.is_empty();
        for binding in &step.secrets {
            let secret = self.secrets.resolve(&binding.secret).await?;

            if let Some(var) = &binding.env {
                let value = secret.value.expose_str().ok_or_else(|| {
                    StagehandError::SecretDecode {
                        secret: binding.secret.clone(),
                        reason: "binary value cannot be bound to an environment variable".into(),
                    }
                })?;
                env.insert(var.clone(), value.to_string());
            }

            if let Some(var) = &binding.file {
                let path = self.secrets.materialize_file(&secret)?;
                env.insert(var.clone(), path.to_string_lossy().to_string());
                needs_scope = true;
            }
        }

        let mounts = if needs_scope {
            vec![self.secrets.scope_dir()?]
        } else {
            Vec::new()
        };

        let ctx = StepContext {
            stage,
            working_dir: &self.working_dir,
            env: &env,
            mounts: &mounts,
            cancel: self.cancel,
        };

        info!(stage, step = %step.name, "running step");
        let result = executor.execute(step, &ctx).await?;

        let redactor = self.secrets.redactor();
        report.log.push_str(&format!("==> {}\n", step.name));
        let output = redactor.redact(&result.output());
        report.log.push_str(&output);
        if !output.is_empty() && !output.ends_with('\n') {
            report.log.push('\n');
        }
        report.steps.push(StepReport {
            name: step.name.clone(),
            exit_code: result.exit_code,
            duration: result.duration,
        });

        if !result.success {
            warn!(stage, step = %step.name, exit_code = result.exit_code, "step failed");
            return Err(StagehandError::StepFailure {
                stage: stage.to_string(),
                step: step.name.clone(),
                exit_code: result.exit_code,
            });
        }

        debug!(stage, step = %step.name, duration = ?result.duration, "step succeeded");
        Ok(())
    }
}

/// Variables every step of `stage` sees, before step env and secrets
///
/// Later layers win: pipeline env, params, run settings, agent env, stage env.
pub fn stage_env(
    pipeline: &Pipeline,
    stage: &Stage,
    run_id: &str,
    code_sign_identity: &str,
    agent: &Agent,
    workspace: &Path,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = pipeline.env.clone();

    for (name, value) in &pipeline.params.extra {
        env.insert(param_var(name), value.clone());
    }
    env.insert(param_var("code_sign_identity"), code_sign_identity.to_string());

    env.insert("STAGEHAND_RUN_ID".into(), run_id.to_string());
    env.insert("STAGEHAND_PIPELINE".into(), pipeline.id.clone());
    env.insert("STAGEHAND_STAGE".into(), stage.id.clone());
    env.insert("STAGEHAND_AGENT".into(), agent.name.clone());
    env.insert(
        "STAGEHAND_WORKSPACE".into(),
        workspace.to_string_lossy().to_string(),
    );

    env.extend(agent.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

fn param_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("STAGEHAND_PARAM_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::create_default_executors;
    use crate::secrets::{DecodeMode, StaticSecretStore};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const PIPELINE: &str = r#"
id: demo
env:
  LANG: C
  SHARED: pipeline
params:
  channel: beta
stages:
  - id: build
    env:
      SHARED: stage
    steps:
      - name: one
        shell: sh
        command: "echo one > one.txt"
      - name: two
        shell: sh
        command: "echo token=$API_TOKEN; echo $SHARED $STAGEHAND_PARAM_CHANNEL; exit 4"
        secrets:
          - secret: API_TOKEN
            env: API_TOKEN
      - name: three
        shell: sh
        command: "echo three > three.txt"
"#;

    fn resolver() -> SecretResolver {
        let store = StaticSecretStore::new().with_string("API_TOKEN", "hunter2-token");
        SecretResolver::new("run-1", Arc::new(store), BTreeMap::<String, DecodeMode>::new())
    }

    #[test]
    fn test_stage_env_layering() {
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();
        let mut agent = Agent::new("mac", &["macos"]);
        agent.env.insert("SHARED".into(), "agent".into());
        agent.env.insert("DEVELOPER_DIR".into(), "/Applications/Xcode.app".into());

        let env = stage_env(
            &pipeline,
            &pipeline.stages[0],
            "run-1",
            "Apple Distribution",
            &agent,
            Path::new("/work/build"),
        );

        assert_eq!(env["SHARED"], "stage");
        assert_eq!(env["LANG"], "C");
        assert_eq!(env["DEVELOPER_DIR"], "/Applications/Xcode.app");
        assert_eq!(env["STAGEHAND_PARAM_CHANNEL"], "beta");
        assert_eq!(env["STAGEHAND_PARAM_CODE_SIGN_IDENTITY"], "Apple Distribution");
        assert_eq!(env["STAGEHAND_STAGE"], "build");
    }

    #[tokio::test]
    async fn test_failing_step_stops_stage_and_redacts_log() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();
        let stage = &pipeline.stages[0];
        let agent = Agent::new("local", &[]);
        let secrets = resolver();
        let executors = create_default_executors();
        let cancel = CancelToken::never();
        let env = stage_env(&pipeline, stage, "run-1", "x", &agent, dir.path());

        let executor = StageExecutor::new(
            stage,
            &executors,
            &secrets,
            &cancel,
            dir.path().to_path_buf(),
            env,
        );
        let mut report = StageReport::new("build", crate::pipeline::StageStatus::Pending);
        let err = executor
            .run_steps(&stage.steps, &[], &mut report)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StagehandError::StepFailure { ref step, exit_code: 4, .. } if step == "two"
        ));
        assert!(dir.path().join("one.txt").exists());
        assert!(!dir.path().join("three.txt").exists());
        assert!(!report.ran_step("three"));
        assert!(report.log.contains("stage beta"));
        assert!(report.log.contains("token=******"), "{}", report.log);
        assert!(!report.log.contains("hunter2-token"));
    }

    #[tokio::test]
    async fn test_file_binding_materializes_secret() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::from_yaml(
            r#"
id: files
stages:
  - id: build
    steps:
      - name: copy
        shell: sh
        command: "cp \"$TOKEN_PATH\" token.copy"
        secrets:
          - secret: API_TOKEN
            file: TOKEN_PATH
"#,
        )
        .unwrap();
        let stage = &pipeline.stages[0];
        let secrets = resolver();
        let executors = create_default_executors();
        let cancel = CancelToken::never();

        let executor = StageExecutor::new(
            stage,
            &executors,
            &secrets,
            &cancel,
            dir.path().to_path_buf(),
            HashMap::new(),
        );
        let mut report = StageReport::new("build", crate::pipeline::StageStatus::Pending);
        executor.run_steps(&stage.steps, &[], &mut report).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("token.copy")).unwrap(),
            "hunter2-token"
        );
    }

    #[tokio::test]
    async fn test_missing_bound_secret_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();
        let stage = &pipeline.stages[0];
        let secrets = SecretResolver::new(
            "run-1",
            Arc::new(StaticSecretStore::new()),
            BTreeMap::new(),
        );
        let executors = create_default_executors();
        let cancel = CancelToken::never();

        let executor = StageExecutor::new(
            stage,
            &executors,
            &secrets,
            &cancel,
            dir.path().to_path_buf(),
            HashMap::new(),
        );
        let mut report = StageReport::new("build", crate::pipeline::StageStatus::Pending);
        let err = executor
            .run_steps(&stage.steps, &[], &mut report)
            .await
            .unwrap_err();

        assert!(err.is_secret_not_found());
        assert!(report.ran_step("one"));
        assert!(!report.ran_step("two"));
    }
}
