// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Watch command - re-run pipeline on file changes
//!
//! Every debounced batch of changes becomes a change event. A newer event
//! cancels the run still in flight before the next one starts.

use colored::Colorize;
use miette::Result;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{base_dir, load_pipeline};
use crate::pipeline::{
    cancel_pair, CancelHandle, CancelToken, ExecutionOptions, Pipeline, PipelineExecutor,
    RunContext, TriggerEvent,
};
use crate::utils::create_spinner;

/// Run the watch command
pub async fn run(
    pipeline_path: PathBuf,
    debounce_ms: u64,
    code_sign_identity: Option<String>,
    verbose: bool,
) -> Result<()> {
    let pipeline = load_pipeline(&pipeline_path)?;
    let base_dir = base_dir(&pipeline_path)?;
    let ignored = ignored_dirs(&pipeline, &base_dir);

    println!("{}", "Starting watch mode...".bold());
    println!("Watching for changes (debounce: {}ms)", debounce_ms);
    println!("Press {} to exit.", "Ctrl+C".cyan());
    println!();

    // Create channel for receiving events
    let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();

    // Create debounced watcher
    let mut debouncer = new_debouncer(
        Duration::from_millis(debounce_ms),
        move |events: DebounceEventResult| {
            let _ = tx.send(events);
        },
    )
    .map_err(|e| miette::miette!("Failed to create file watcher: {}", e))?;

    debouncer
        .watcher()
        .watch(&base_dir, RecursiveMode::Recursive)
        .map_err(|e| miette::miette!("Failed to start watching: {}", e))?;

    let runner = Runner {
        pipeline_path,
        base_dir: base_dir.clone(),
        code_sign_identity,
        verbose,
    };

    // Initial run
    let mut current: Option<(CancelHandle, JoinHandle<()>)> =
        Some(runner.spawn(TriggerEvent::Manual));
    let mut spinner: Option<indicatif::ProgressBar> = None;

    loop {
        tokio::select! {
            events = rx.recv() => {
                let Some(events) = events else {
                    break;
                };

                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        eprintln!("{}: {:?}", "Watch error".red(), e);
                        continue;
                    }
                };

                // Filter out irrelevant events
                let mut paths: Vec<String> = events
                    .iter()
                    .filter(|e| matches!(e.kind, DebouncedEventKind::Any))
                    .filter_map(|e| relative_path(&e.path, &base_dir, &ignored))
                    .collect();
                paths.sort();
                paths.dedup();

                if paths.is_empty() {
                    continue;
                }

                if let Some(spinner) = spinner.take() {
                    spinner.finish_and_clear();
                }

                if let Some((cancel, task)) = current.take() {
                    cancel.cancel();
                    let _ = task.await;
                }

                println!();
                println!("{}", "─".repeat(50).dimmed());
                println!(
                    "{}: {} file(s) changed",
                    "Change detected".yellow(),
                    paths.len()
                );

                if verbose {
                    for path in &paths {
                        println!("  {}", path);
                    }
                }

                println!();
                current = Some(runner.spawn(TriggerEvent::Change { paths }));
            }

            _ = async {
                match current.as_mut() {
                    Some((_, task)) => {
                        let _ = task.await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                current = None;
                spinner = Some(create_spinner("Waiting for changes..."));
            }

            _ = tokio::signal::ctrl_c() => {
                if let Some((cancel, task)) = current.take() {
                    cancel.cancel();
                    let _ = task.await;
                }
                break;
            }
        }
    }

    if let Some(spinner) = spinner.take() {
        spinner.finish_and_clear();
    }

    Ok(())
}

/// Directories whose changes never trigger a run
fn ignored_dirs(pipeline: &Pipeline, base_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![
        base_dir.join(".stagehand"),
        base_dir.join(".git"),
        base_dir.join(&pipeline.artifacts.directory),
        pipeline.cache.resolve_directory(base_dir),
    ];
    dirs.extend(
        pipeline
            .stages
            .iter()
            .map(|s| s.workspace_dir(base_dir))
            .filter(|dir| dir != base_dir),
    );
    dirs
}

/// Path relative to `base_dir`, or `None` when it should be ignored
fn relative_path(path: &Path, base_dir: &Path, ignored: &[PathBuf]) -> Option<String> {
    if ignored.iter().any(|dir| path.starts_with(dir)) {
        return None;
    }
    let relative = path.strip_prefix(base_dir).ok()?;
    Some(relative.to_string_lossy().replace('\\', "/"))
}

struct Runner {
    pipeline_path: PathBuf,
    base_dir: PathBuf,
    code_sign_identity: Option<String>,
    verbose: bool,
}

impl Runner {
    fn spawn(&self, trigger: TriggerEvent) -> (CancelHandle, JoinHandle<()>) {
        let (cancel, token) = cancel_pair();
        let task = tokio::spawn(run_pipeline(
            self.pipeline_path.clone(),
            self.base_dir.clone(),
            self.code_sign_identity.clone(),
            trigger,
            token,
            self.verbose,
        ));
        (cancel, task)
    }
}

async fn run_pipeline(
    pipeline_path: PathBuf,
    base_dir: PathBuf,
    code_sign_identity: Option<String>,
    trigger: TriggerEvent,
    cancel: CancelToken,
    verbose: bool,
) {
    let start = std::time::Instant::now();

    // Reload, the pipeline file may be what changed
    let pipeline = match Pipeline::from_file(&pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Failed to load pipeline".red(), e);
            return;
        }
    };

    let executor = match PipelineExecutor::from_pipeline(&pipeline, &base_dir) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("{}: {}", "Failed to set up executor".red(), e);
            return;
        }
    };

    let ctx = RunContext::new(&base_dir)
        .with_code_sign_identity(code_sign_identity)
        .with_trigger(trigger)
        .with_cancel(cancel);

    let options = ExecutionOptions {
        verbose,
        ..Default::default()
    };

    // Execute
    match executor.execute(Arc::new(pipeline), &ctx, &options).await {
        Ok(run) => {
            let elapsed = start.elapsed();
            if run.succeeded() {
                println!(
                    "{} ({:.2}s)",
                    "Run finished".green(),
                    elapsed.as_secs_f64()
                );
            } else {
                println!(
                    "{} {} ({:.2}s)",
                    "Run did not succeed:".red(),
                    run.run_id,
                    elapsed.as_secs_f64()
                );
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Pipeline execution error".red(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_in_workspaces_are_ignored() {
        let pipeline =
            Pipeline::from_yaml(include_str!("../../pipelines/unity-ios.yaml")).unwrap();
        let base = Path::new("/repo");
        let ignored = ignored_dirs(&pipeline, base);

        assert_eq!(
            relative_path(Path::new("/repo/fastlane/Fastfile"), base, &ignored).as_deref(),
            Some("fastlane/Fastfile")
        );
        assert_eq!(
            relative_path(Path::new("/repo/ios/build/out.ipa"), base, &ignored),
            None
        );
        assert_eq!(
            relative_path(Path::new("/repo/.stagehand/artifacts/x"), base, &ignored),
            None
        );
    }
}
