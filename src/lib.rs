// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! # stagehand - Build Pipeline Orchestrator
//!
//! `stagehand` runs multi-stage build pipelines: a stage builds an
//! intermediate project, publishes it as an artifact, and a later stage on a
//! different agent consumes it and packages the final product.
//!
//! ## Features
//!
//! - **Dependency graph** - Stages run in topological order, dependents of a failed stage are skipped
//! - **Artifacts** - Publish and consume rules (`out/pkg => pkg.zip`, `pkg.zip!** => in`)
//! - **Caching** - Workspace paths survive between runs as atomic snapshots
//! - **Secrets** - Resolved once per run, redacted from logs, shredded at the end
//! - **Signed packaging** - A provisioning profile selects the signed path, its absence the unsigned one
//!
//! ## Quick Start
//!
//! ```bash
//! # Check the pipeline
//! stagehand validate
//!
//! # Show the stage graph
//! stagehand graph --format mermaid
//!
//! # Run pipeline
//! stagehand run
//! ```

pub mod agents;
pub mod artifacts;
pub mod cache;
pub mod cli;
pub mod errors;
pub mod executors;
pub mod pipeline;
pub mod secrets;
pub mod signing;
pub mod utils;

// Re-export commonly used types
pub use errors::{StagehandError, StagehandResult};
pub use pipeline::{BuildRun, Pipeline, PipelineExecutor, Stage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
