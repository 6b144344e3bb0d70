// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Pipeline executor
//!
//! Orchestrates the execution of pipeline stages in dependency order.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use tracing::{debug, error, info, warn};

use crate::agents::AgentPool;
use crate::artifacts::ArtifactStore;
use crate::cache::{Cache, CacheKey, FilesystemCache};
use crate::errors::{StagehandError, StagehandResult};
use crate::executors::{create_default_executors, executor_key, Executor};
use crate::pipeline::stage::{stage_env, StageExecutor};
use crate::pipeline::{
    new_run_id, BuildRun, CancelToken, DagBuilder, FailureReason, Pipeline, RunContext,
    SkipReason, Stage, StageReport, StageStatus,
};
use crate::secrets::{self, SecretResolver, SecretStore};
use crate::signing::{BranchEvaluator, PackagingPath, DEFAULT_CODE_SIGN_IDENTITY};
use crate::utils::colors::status_marker;

/// Pipeline execution options
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Skip cache restores and stores
    pub no_cache: bool,
    /// Only show what would be done
    pub dry_run: bool,
    /// Only run specific stages (and what they depend on)
    pub stages: Vec<String>,
    /// Print the log of failed stages
    pub verbose: bool,
}

/// Pipeline executor
pub struct PipelineExecutor {
    /// Registered executors by environment kind
    executors: HashMap<String, Box<dyn Executor>>,
    /// Cache layer
    cache: Option<Arc<dyn Cache>>,
    artifacts: ArtifactStore,
    agents: Arc<AgentPool>,
    secret_store: Arc<dyn SecretStore>,
}

impl PipelineExecutor {
    /// Create a new pipeline executor with no registered executors
    pub fn new(
        artifacts: ArtifactStore,
        agents: AgentPool,
        secret_store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            executors: HashMap::new(),
            cache: None,
            artifacts,
            agents: Arc::new(agents),
            secret_store,
        }
    }

    /// Executor wired the way `pipeline` configures it, paths relative to `base_dir`
    pub fn from_pipeline(pipeline: &Pipeline, base_dir: &Path) -> StagehandResult<Self> {
        let mut executor = Self::new(
            ArtifactStore::new(base_dir.join(&pipeline.artifacts.directory)),
            AgentPool::for_agents(&pipeline.agents),
            secrets::create_store(&pipeline.secret_store, base_dir)?,
        );

        for (name, exec) in create_default_executors() {
            executor.register_executor(&name, exec);
        }

        if pipeline.cache.enabled {
            let cache = FilesystemCache::new(
                pipeline.cache.resolve_directory(base_dir),
                pipeline.cache.retain,
            )?;
            executor = executor.with_cache(Arc::new(cache));
        }

        Ok(executor)
    }

    /// Register an executor for an environment kind (`host`, `container`)
    pub fn register_executor(&mut self, name: &str, executor: Box<dyn Executor>) {
        self.executors.insert(name.to_string(), executor);
    }

    /// Set the cache layer
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Execute a pipeline
    ///
    /// Stage failures are recorded on the returned run. `Err` is reserved for
    /// problems with the pipeline itself (cycles, unknown stages).
    pub async fn execute(
        &self,
        pipeline: Arc<Pipeline>,
        ctx: &RunContext,
        options: &ExecutionOptions,
    ) -> StagehandResult<BuildRun> {
        let start = Instant::now();

        // Build and validate DAG
        let dag = DagBuilder::build(&pipeline)?;
        let execution_order = dag.topological_order()?;
        let selected = dag.select(&pipeline, &ctx.trigger, &options.stages)?;

        let run_id = new_run_id();
        let resolver = Arc::new(SecretResolver::new(
            run_id.clone(),
            self.secret_store.clone(),
            pipeline.secrets.clone(),
        ));
        let mut run = BuildRun::new(
            run_id.clone(),
            pipeline.clone(),
            ctx.trigger.clone(),
            resolver.clone(),
        );
        run.dry_run = options.dry_run;

        // Print execution plan
        self.print_execution_plan(&pipeline, &execution_order, &selected, &dag);

        if options.dry_run {
            for &idx in &execution_order {
                let status = if selected.contains(&idx) {
                    StageStatus::Pending
                } else {
                    StageStatus::Skipped(SkipReason::NotSelected)
                };
                run.reports
                    .push(StageReport::new(&pipeline.stages[idx].id, status));
            }
            resolver.teardown();
            return Ok(run);
        }

        info!(run_id = %run_id, pipeline = %pipeline.id, "run started");

        let code_sign_identity = ctx
            .code_sign_identity
            .clone()
            .or_else(|| pipeline.params.code_sign_identity.clone())
            .unwrap_or_else(|| DEFAULT_CODE_SIGN_IDENTITY.to_string());

        // Execute stages in order
        for idx in execution_order {
            let stage = &pipeline.stages[idx];

            let report = if !selected.contains(&idx) {
                StageReport::new(&stage.id, StageStatus::Skipped(SkipReason::NotSelected))
            } else if ctx.cancel.is_cancelled() {
                StageReport::new(&stage.id, StageStatus::Cancelled)
            } else if let Some(upstream) = failed_upstream(&run, stage) {
                info!(stage = %stage.id, upstream, "skipping stage, upstream did not succeed");
                StageReport::new(
                    &stage.id,
                    StageStatus::Skipped(SkipReason::UpstreamFailed {
                        stage: upstream.to_string(),
                    }),
                )
            } else {
                print!("  {} {}...", "→".blue(), stage.display_name());
                let stage_ctx = StageRun {
                    pipeline: &pipeline,
                    stage,
                    run_id: &run_id,
                    resolver: &resolver,
                    ctx,
                    code_sign_identity: &code_sign_identity,
                    options,
                };
                self.run_stage(&stage_ctx).await
            };

            self.print_stage_result(stage, &report, options.verbose);
            run.reports.push(report);
        }

        resolver.teardown();
        run.duration = start.elapsed();

        // Print summary
        println!();
        let secs = run.duration.as_secs_f64();
        match run.status() {
            crate::pipeline::RunStatus::Succeeded => println!(
                "{}",
                format!("Pipeline completed successfully in {:.2}s", secs).green()
            ),
            crate::pipeline::RunStatus::Failed => {
                println!("{}", format!("Pipeline failed after {:.2}s", secs).red())
            }
            crate::pipeline::RunStatus::Cancelled => {
                println!("{}", format!("Pipeline cancelled after {:.2}s", secs).yellow())
            }
        }

        info!(run_id = %run_id, status = ?run.status(), "run finished");
        Ok(run)
    }

    /// Run one stage and turn its outcome into a report
    async fn run_stage(&self, run: &StageRun<'_>) -> StageReport {
        let started = Instant::now();
        let mut report = StageReport::new(&run.stage.id, StageStatus::Pending);

        report.status = match self.run_stage_inner(run, &mut report).await {
            Ok(()) => StageStatus::Succeeded,
            Err(StagehandError::Cancelled) => {
                warn!(stage = %run.stage.id, "stage cancelled");
                StageStatus::Cancelled
            }
            Err(e) => {
                error!(stage = %run.stage.id, error = %e, "stage failed");
                StageStatus::Failed(FailureReason::from_error(&e))
            }
        };
        report.duration = started.elapsed();
        report
    }

    async fn run_stage_inner(
        &self,
        run: &StageRun<'_>,
        report: &mut StageReport,
    ) -> StagehandResult<()> {
        let stage = run.stage;
        let pipeline = run.pipeline;
        let cancel = &run.ctx.cancel;

        // Agent
        let lease = cancellable(
            cancel,
            self.agents
                .acquire(&stage.id, &stage.requirements, pipeline.timeouts.agent_queue()),
        )
        .await?;
        report.agent = Some(lease.agent().name.clone());

        // Workspace
        let workspace = stage.workspace_dir(&run.ctx.workspace_root);
        std::fs::create_dir_all(&workspace)
            .map_err(|e| StagehandError::write_failed(&workspace, e))?;

        // Consumed artifacts, all present before any step runs
        self.artifacts.reset_destinations(
            &workspace,
            stage.dependencies.iter().flat_map(|d| &d.artifacts),
        )?;
        for dependency in &stage.dependencies {
            for rule in &dependency.artifacts {
                let artifact = rule.consumed_artifact();
                cancellable(
                    cancel,
                    self.artifacts.wait_for(
                        run.run_id,
                        &dependency.stage,
                        &artifact,
                        pipeline.timeouts.artifact_wait(),
                    ),
                )
                .await?;
                self.artifacts
                    .consume(run.run_id, &dependency.stage, rule, &workspace)?;
            }
        }

        // Cache restore
        if let Some(cache) = self.cache.as_ref().filter(|_| !run.options.no_cache) {
            for rule in stage.cache.iter().filter(|r| r.use_cache) {
                let key = CacheKey::new(&pipeline.id, &stage.id, &rule.name);
                match cache.restore(&key, &workspace.join(&rule.path)).await {
                    Ok(true) => report.cache_restored.push(rule.name.clone()),
                    Ok(false) => debug!(stage = %stage.id, rule = %rule.name, "cache miss"),
                    Err(e) => {
                        warn!(stage = %stage.id, rule = %rule.name, error = %e, "cache restore failed");
                        report.warnings.push(e.to_string());
                    }
                }
            }
        }

        // Steps
        let env = stage_env(
            pipeline,
            stage,
            run.run_id,
            run.code_sign_identity,
            lease.agent(),
            &workspace,
        );
        let steps = StageExecutor::new(
            stage,
            &self.executors,
            run.resolver,
            cancel,
            workspace.clone(),
            env,
        );
        steps.run_steps(&stage.steps, &[], report).await?;

        // Packaging branch
        if let Some(packaging) = &stage.packaging {
            if cancel.is_cancelled() {
                return Err(StagehandError::Cancelled);
            }
            let path = BranchEvaluator::new(packaging, run.code_sign_identity)
                .evaluate(run.resolver)
                .await?;
            report.packaging = Some(path.decision());

            match path {
                PackagingPath::Unsigned => {
                    steps.run_steps(&packaging.unsigned, &[], report).await?;
                }
                PackagingPath::Signed(identity) => {
                    let extra = identity.step_env(run.resolver)?;
                    steps.run_steps(&packaging.signed, &extra, report).await?;
                }
            }
        }

        // Publish
        let manifest = self
            .artifacts
            .publish(run.run_id, &stage.id, &workspace, &stage.artifacts)?;
        report.artifacts = manifest.artifacts.keys().cloned().collect();

        // Cache store; failures never fail the stage
        if let Some(cache) = self.cache.as_ref().filter(|_| !run.options.no_cache) {
            for rule in stage.cache.iter().filter(|r| r.publish) {
                let key = CacheKey::new(&pipeline.id, &stage.id, &rule.name);
                if let Err(e) = cache.store(&key, &workspace.join(&rule.path)).await {
                    warn!(stage = %stage.id, rule = %rule.name, error = %e, "cache write failed");
                    report.warnings.push(e.to_string());
                }
            }
        }

        Ok(())
    }

    /// Print the execution plan
    fn print_execution_plan(
        &self,
        pipeline: &Pipeline,
        order: &[usize],
        selected: &BTreeSet<usize>,
        dag: &DagBuilder,
    ) {
        println!();
        println!("{}: {}", "Pipeline".bold(), pipeline.display_name());
        println!("{}", "═".repeat(50));
        println!(
            "Execution plan ({} of {} stage{}):",
            selected.len(),
            order.len(),
            if order.len() == 1 { "" } else { "s" }
        );
        println!();

        for (i, &idx) in order.iter().enumerate() {
            let stage = &pipeline.stages[idx];
            let deps = dag.dependencies(&stage.id).unwrap_or_default();

            let name = if selected.contains(&idx) {
                stage.display_name().bold()
            } else {
                stage.display_name().dimmed()
            };
            print!("  {}. {}", i + 1, name);

            if !stage.requirements.is_empty() {
                print!(" ({})", stage.requirements.join(", "));
            }
            if !deps.is_empty() {
                print!(" {}", format!("[depends: {}]", deps.join(", ")).dimmed());
            }

            println!();
        }

        println!();
    }

    fn print_stage_result(&self, stage: &Stage, report: &StageReport, verbose: bool) {
        let marker = status_marker(&report.status);
        match &report.status {
            StageStatus::Succeeded => {
                let mut line = format!(
                    "\r  {} {} ({:.2}s)",
                    marker,
                    stage.display_name().bold(),
                    report.duration.as_secs_f64()
                );
                if let Some(packaging) = report.packaging {
                    line.push_str(&format!(" {}", format!("[{}]", packaging).dimmed()));
                }
                println!("{}", line);
                for warning in &report.warnings {
                    println!("      {} {}", "⚠".yellow(), warning);
                }
            }
            StageStatus::Failed(reason) => {
                println!(
                    "\r  {} {} failed: {}",
                    marker,
                    stage.display_name().bold(),
                    reason
                );
                if verbose && !report.log.is_empty() {
                    eprintln!("{}", report.log.dimmed());
                }
            }
            StageStatus::Skipped(reason) => {
                println!(
                    "  {} {} {}",
                    marker,
                    stage.display_name(),
                    format!("(skipped: {})", reason).dimmed()
                );
            }
            StageStatus::Cancelled => {
                println!("\r  {} {} cancelled", marker, stage.display_name());
            }
            StageStatus::Pending => {}
        }
    }

    /// Check if all required tools are available
    pub async fn check_tools(&self, pipeline: &Pipeline) -> StagehandResult<Vec<String>> {
        let mut missing = Vec::new();

        let kinds: BTreeSet<&str> = pipeline
            .stages
            .iter()
            .flat_map(|s| s.all_steps())
            .map(|step| executor_key(&step.environment))
            .collect();

        for kind in kinds {
            if let Some(executor) = self.executors.get(kind) {
                match executor.check_available().await {
                    Ok(true) => {}
                    Ok(false) => missing.push(kind.to_string()),
                    Err(_) => missing.push(kind.to_string()),
                }
            } else {
                missing.push(kind.to_string());
            }
        }

        let uses_secrets = pipeline.stages.iter().any(|s| {
            s.packaging.is_some() || s.all_steps().any(|step| !step.secrets.is_empty())
        });
        if uses_secrets && !self.secret_store.check_available().await.unwrap_or(false) {
            missing.push(self.secret_store.name().to_string());
        }

        Ok(missing)
    }
}

/// Per-stage inputs shared by the stage phases
struct StageRun<'a> {
    pipeline: &'a Pipeline,
    stage: &'a Stage,
    run_id: &'a str,
    resolver: &'a SecretResolver,
    ctx: &'a RunContext,
    code_sign_identity: &'a str,
    options: &'a ExecutionOptions,
}

/// First upstream of `stage` that did not succeed in `run`
fn failed_upstream<'a>(run: &BuildRun, stage: &'a Stage) -> Option<&'a str> {
    stage
        .upstream_ids()
        .into_iter()
        .find(|upstream| !run.report(upstream).is_some_and(|r| r.status.is_success()))
}

async fn cancellable<T>(
    cancel: &CancelToken,
    fut: impl std::future::Future<Output = StagehandResult<T>>,
) -> StagehandResult<T> {
    tokio::select! {
        result = fut => result,
        _ = cancel.cancelled() => Err(StagehandError::Cancelled),
    }
}
