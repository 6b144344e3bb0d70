// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Run command - execute the pipeline

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::{base_dir, load_pipeline};
use crate::errors::RecoverySuggestion;
use crate::pipeline::{
    cancel_pair, ExecutionOptions, PipelineExecutor, PipelineValidator, RunContext,
};

/// Arguments of the run command
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub pipeline: PathBuf,
    pub stages: Vec<String>,
    pub no_cache: bool,
    pub dry_run: bool,
    pub code_sign_identity: Option<String>,
    pub report: Option<PathBuf>,
}

/// Run the pipeline
pub async fn run(args: RunArgs, verbose: bool) -> Result<()> {
    let pipeline = load_pipeline(&args.pipeline)?;

    // Validate pipeline
    let validation = PipelineValidator::validate(&pipeline)?;

    if !validation.is_valid() {
        eprintln!("{}", "Pipeline validation failed:".red().bold());
        for error in &validation.errors {
            eprintln!("  {} {}", "✗".red(), error);
        }
        return Err(miette::miette!("Pipeline configuration is invalid"));
    }

    if validation.has_warnings() && verbose {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in &validation.warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }

    let base_dir = base_dir(&args.pipeline)?;
    let executor = PipelineExecutor::from_pipeline(&pipeline, &base_dir)?;

    // Check required tools are available
    if !args.dry_run {
        let missing_tools = executor.check_tools(&pipeline).await?;
        if !missing_tools.is_empty() {
            eprintln!("{}", "Missing required tools:".red().bold());
            for tool in &missing_tools {
                eprintln!("  {} {}", "✗".red(), tool);
                match tool.as_str() {
                    "container" => eprintln!(
                        "    Install: {}",
                        "https://docs.docker.com/get-docker/".cyan()
                    ),
                    "aws-cli" => eprintln!(
                        "    Install: {}",
                        "https://aws.amazon.com/cli/".cyan()
                    ),
                    _ => {}
                }
            }
            return Err(miette::miette!("Required tools are not installed"));
        }
    }

    // Ctrl+C cancels the run; running commands are killed
    let (cancel, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let ctx = RunContext::new(&base_dir)
        .with_code_sign_identity(args.code_sign_identity)
        .with_cancel(token);

    let options = ExecutionOptions {
        no_cache: args.no_cache,
        dry_run: args.dry_run,
        stages: args.stages,
        verbose,
    };

    // Execute
    let run = executor.execute(Arc::new(pipeline), &ctx, &options).await?;

    if let Some(path) = &args.report {
        std::fs::write(path, run.to_json()?)
            .map_err(|e| miette::miette!("Failed to write report {}: {}", path.display(), e))?;
    }

    if !run.succeeded() {
        for (stage, reason) in run.failures() {
            eprintln!();
            eprintln!("{}", format!("Stage '{}' failed:", stage).red().bold());
            eprintln!("{}", RecoverySuggestion::for_failure(stage, reason));
        }
        return Err(miette::miette!("Pipeline run {} did not succeed", run.run_id));
    }

    // Print published artifacts
    let artifacts = executor.artifacts().list(&run.run_id);
    if !artifacts.is_empty() {
        println!();
        println!("{}:", "Artifacts".bold());
        for (stage, artifact) in artifacts {
            println!(
                "  - {}",
                executor
                    .artifacts()
                    .root()
                    .join(&run.run_id)
                    .join(&stage)
                    .join(&artifact)
                    .display()
            );
        }
    }

    Ok(())
}
