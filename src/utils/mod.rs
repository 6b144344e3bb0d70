// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Utility modules
//!
//! Terminal output helpers and filesystem tree copying.

pub mod colors;
pub mod fs;
pub mod spinner;

pub use colors::*;
pub use spinner::*;
