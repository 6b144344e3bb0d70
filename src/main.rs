// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! stagehand - Build Pipeline Orchestrator
//!
//! Runs multi-stage build pipelines with artifacts, caches, secrets and
//! signed packaging.

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stagehand::cli::run::RunArgs;
use stagehand::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagehand=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    // Change to specified directory if provided
    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    // Dispatch to command handlers
    match cli.command {
        Commands::Run {
            pipeline,
            stage,
            no_cache,
            dry_run,
            code_sign_identity,
            report,
        } => {
            let args = RunArgs {
                pipeline,
                stages: stage,
                no_cache,
                dry_run,
                code_sign_identity,
                report,
            };
            stagehand::cli::run::run(args, cli.verbose).await
        }
        Commands::Watch {
            pipeline,
            debounce,
            code_sign_identity,
        } => stagehand::cli::watch::run(pipeline, debounce, code_sign_identity, cli.verbose).await,
        Commands::Validate { pipeline } => {
            stagehand::cli::validate::run(pipeline, cli.verbose).await
        }
        Commands::Cache { pipeline, action } => {
            stagehand::cli::cache::run(pipeline, action, cli.verbose).await
        }
        Commands::Graph { pipeline, format } => {
            stagehand::cli::graph::run(pipeline, format, cli.verbose).await
        }
    }
}
