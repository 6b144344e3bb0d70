// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for stagehand.

pub mod cache;
pub mod graph;
pub mod run;
pub mod validate;
pub mod watch;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::pipeline::Pipeline;

/// Build pipeline orchestrator
///
/// Runs multi-stage build pipelines with artifacts, caches and secrets.
#[derive(Parser, Debug)]
#[clap(
    name = "stagehand",
    version,
    about = "Build pipeline orchestrator with artifacts, caches, secrets and signed packaging",
    long_about = None,
    after_help = "Examples:\n\
        stagehand validate                      Check the pipeline file\n\
        stagehand graph -f mermaid              Show the stage graph\n\
        stagehand run                           Execute the pipeline\n\
        stagehand run -s build-ios-app          Run one stage and its upstreams\n\
        stagehand watch                         Re-run on file changes\n\n\
        See 'stagehand <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline
    Run {
        /// Pipeline file
        #[clap(short, long, default_value = ".stagehand.yaml")]
        pipeline: PathBuf,

        /// Run only specific stages (plus their upstream stages)
        #[clap(short, long)]
        stage: Vec<String>,

        /// Skip cache restores and stores
        #[clap(long)]
        no_cache: bool,

        /// Dry run (show what would be done)
        #[clap(long)]
        dry_run: bool,

        /// Code signing identity for signed packaging
        #[clap(long, env = "STAGEHAND_CODE_SIGN_IDENTITY")]
        code_sign_identity: Option<String>,

        /// Write the run report as JSON to this file
        #[clap(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Watch mode - re-run pipeline on file changes
    Watch {
        /// Pipeline file
        #[clap(short, long, default_value = ".stagehand.yaml")]
        pipeline: PathBuf,

        /// Debounce delay in milliseconds
        #[clap(long, default_value = "500")]
        debounce: u64,

        /// Code signing identity for signed packaging
        #[clap(long, env = "STAGEHAND_CODE_SIGN_IDENTITY")]
        code_sign_identity: Option<String>,
    },

    /// Validate pipeline configuration
    Validate {
        /// Pipeline file to validate
        #[clap(default_value = ".stagehand.yaml")]
        pipeline: PathBuf,
    },

    /// Cache management
    Cache {
        /// Pipeline file whose cache settings to use
        #[clap(short, long, default_value = ".stagehand.yaml")]
        pipeline: PathBuf,

        #[clap(subcommand)]
        action: CacheAction,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        #[clap(default_value = ".stagehand.yaml")]
        pipeline: PathBuf,

        /// Output format
        #[clap(short, long, value_enum, default_value = "text")]
        format: GraphFormat,
    },
}

/// Cache management actions
#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show cache statistics
    Stats,

    /// Clear the cache
    Clear {
        /// Skip confirmation
        #[clap(short, long)]
        yes: bool,
    },

    /// List cached entries
    List,
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

/// Load a pipeline file, with a hint when it does not exist
pub(crate) fn load_pipeline(path: &Path) -> miette::Result<Pipeline> {
    if !path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}\n\n\
             Create a .stagehand.yaml or pass --pipeline.",
            path.display()
        ));
    }

    Pipeline::from_file(path).map_err(|e| miette::miette!("Failed to load pipeline: {}", e))
}

/// Directory relative pipeline paths resolve against
pub(crate) fn base_dir(pipeline_path: &Path) -> miette::Result<PathBuf> {
    let cwd = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;

    Ok(match pipeline_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => cwd.join(parent),
        _ => cwd,
    })
}
