// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Cache command - manage the cache

use colored::Colorize;
use miette::Result;
use std::io::{self, Write};
use std::path::PathBuf;

use super::{base_dir, CacheAction};
use crate::cache::{Cache, FilesystemCache};
use crate::pipeline::{CacheConfig, Pipeline};

/// Run the cache command
pub async fn run(pipeline_path: PathBuf, action: CacheAction, _verbose: bool) -> Result<()> {
    // Without a pipeline file the shared default location is used
    let config = if pipeline_path.exists() {
        Pipeline::from_file(&pipeline_path)?.cache
    } else {
        CacheConfig::default()
    };

    let cache_dir = config.resolve_directory(&base_dir(&pipeline_path)?);
    let cache = FilesystemCache::new(cache_dir.clone(), config.retain)?;

    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await?;

            println!("{}", "Cache Statistics".bold());
            println!("{}", "═".repeat(40));
            println!("  Location: {}", cache_dir.display());
            println!("  Entries:  {}", stats.entries);
            println!("  Size:     {}", stats.formatted_size());

            if let Some(oldest) = stats.oldest_entry {
                if let Ok(duration) = oldest.elapsed() {
                    println!("  Oldest:   {} ago", format_duration(duration));
                }
            }

            if let Some(newest) = stats.newest_entry {
                if let Ok(duration) = newest.elapsed() {
                    println!("  Newest:   {} ago", format_duration(duration));
                }
            }

            Ok(())
        }

        CacheAction::Clear { yes } => {
            let stats = cache.stats().await?;

            if stats.entries == 0 {
                println!("{}", "Cache is already empty.".dimmed());
                return Ok(());
            }

            if !yes {
                print!(
                    "Clear {} cache entries ({})? [y/N] ",
                    stats.entries,
                    stats.formatted_size()
                );
                io::stdout().flush().ok();

                let mut input = String::new();
                io::stdin().read_line(&mut input).ok();

                if !input.trim().eq_ignore_ascii_case("y") {
                    println!("{}", "Cancelled.".dimmed());
                    return Ok(());
                }
            }

            cache.clear().await?;
            println!("{}", "Cache cleared.".green());

            Ok(())
        }

        CacheAction::List => {
            let entries = cache.entries()?;

            println!("{}", "Cached Entries".bold());
            println!("{}", "═".repeat(40));

            if entries.is_empty() {
                println!("{}", "  No cached entries.".dimmed());
                return Ok(());
            }

            for entry in entries {
                let age = entry
                    .created_at
                    .elapsed()
                    .map(format_duration)
                    .unwrap_or_else(|_| "?".into());
                let digest = entry.content_digest.get(..12).unwrap_or(&entry.content_digest);
                println!(
                    "  {} {} {}",
                    entry.key.to_string().bold(),
                    format_size(entry.size_bytes),
                    format!("({} ago, {})", age, digest).dimmed()
                );
            }
            println!();
            println!(
                "{}",
                "  Run 'stagehand run --no-cache' to bypass cache.".dimmed()
            );

            Ok(())
        }
    }
}

fn format_size(bytes: u64) -> String {
    crate::cache::CacheStats {
        size_bytes: bytes,
        ..Default::default()
    }
    .formatted_size()
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
