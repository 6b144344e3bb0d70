// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Graph command - visualize pipeline as a graph

use miette::Result;
use std::path::PathBuf;

use super::{load_pipeline, GraphFormat};
use crate::errors::{RecoverySuggestion, StagehandError};
use crate::pipeline::DagBuilder;

/// Run the graph command
pub async fn run(pipeline_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_path)?;

    // Build DAG
    let dag = match DagBuilder::build(&pipeline) {
        Ok(dag) => dag,
        Err(StagehandError::CircularDependency { stages }) => {
            eprintln!("{}", RecoverySuggestion::fix_circular_dependency(&stages));
            return Err(miette::miette!(
                "Pipeline has a circular dependency: {}",
                stages.join(", ")
            ));
        }
        Err(e) => return Err(e.into()),
    };

    // Output in requested format
    let output = match format {
        GraphFormat::Text => dag.to_text(&pipeline)?,
        GraphFormat::Dot => dag.to_dot(),
        GraphFormat::Mermaid => dag.to_mermaid(&pipeline),
    };

    println!("{}", output);

    Ok(())
}
