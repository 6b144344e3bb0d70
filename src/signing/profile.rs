// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Provisioning profile inspection
//!
//! A `.mobileprovision` file is a CMS envelope around an XML property list.
//! The plist travels unencrypted inside the envelope, so the `Name` entry can
//! be read straight from the bytes without verifying the signature.

use regex::bytes::Regex;

const NAME_PATTERN: &str = r"(?s)<key>\s*Name\s*</key>\s*<string>([^<]*)</string>";

/// Human-readable name of a provisioning profile, if the plist carries one
pub fn extract_profile_name(profile: &[u8]) -> Option<String> {
    let re = Regex::new(NAME_PATTERN).ok()?;
    let captures = re.captures(profile)?;
    let raw = std::str::from_utf8(captures.get(1)?.as_bytes()).ok()?;

    let name = unescape_xml(raw.trim());
    (!name.is_empty()).then_some(name)
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
