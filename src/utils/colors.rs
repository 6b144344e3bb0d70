// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Terminal color utilities

use colored::Colorize;

use crate::pipeline::StageStatus;

/// One-symbol marker for a stage status
pub fn status_marker(status: &StageStatus) -> colored::ColoredString {
    match status {
        StageStatus::Pending => "·".dimmed(),
        StageStatus::Succeeded => "✓".green(),
        StageStatus::Failed(_) => "✗".red(),
        StageStatus::Skipped(_) => "○".dimmed(),
        StageStatus::Cancelled => "⊘".yellow(),
    }
}
