// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Pipeline definitions and execution
//!
//! This module defines the pipeline data model (stages, steps, dependency
//! edges) and drives build runs over it.

mod dag;
mod definition;
mod executor;
mod run;
mod stage;
mod validation;

pub use dag::DagBuilder;
pub use definition::*;
pub use executor::{ExecutionOptions, PipelineExecutor};
pub use run::{
    cancel_pair, new_run_id, BuildRun, CancelHandle, CancelToken, FailureReason, RunContext,
    RunStatus, SkipReason, StageReport, StageStatus, StepReport, TriggerEvent,
};
pub use stage::{stage_env, StageExecutor};
pub use validation::{PipelineValidator, ValidationResult};
