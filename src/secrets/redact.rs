// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Log redaction for resolved secret values

use base64::Engine;
use std::sync::{Arc, RwLock};

const MASK: &str = "******";

/// Shortest line of a multi-line value, or printable run of a binary value,
/// masked on its own
const MIN_FRAGMENT_LEN: usize = 4;

/// Replaces every registered secret value in captured text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    values: Arc<RwLock<Vec<String>>>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoded value for masking
    ///
    /// Text values are masked whole and line by line. Binary values are
    /// masked in the lossy text form a log would show, by their printable
    /// runs, and in base64.
    pub fn register(&self, value: &[u8]) {
        if value.is_empty() {
            return;
        }

        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        let mut push = |candidate: &str| {
            if !candidate.is_empty() && !values.iter().any(|v| v == candidate) {
                values.push(candidate.to_string());
            }
        };

        match std::str::from_utf8(value) {
            Ok(text) => {
                push(text);
                push(text.trim());
                if text.contains('\n') {
                    for line in text
                        .lines()
                        .map(str::trim)
                        .filter(|l| l.len() >= MIN_FRAGMENT_LEN)
                    {
                        push(line);
                    }
                }
            }
            Err(_) => {
                push(String::from_utf8_lossy(value).as_ref());
                push(base64::engine::general_purpose::STANDARD.encode(value).as_str());
                for run in printable_runs(value) {
                    push(run);
                }
            }
        }

        // Longest first so a value containing another is masked whole
        values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// Mask every registered value in `text`
    pub fn redact(&self, text: &str) -> String {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        let mut out = text.to_string();
        for value in values.iter() {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), MASK);
            }
        }
        out
    }

    /// Forget every registered value
    pub fn clear(&self) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        for value in values.drain(..) {
            let mut bytes = value.into_bytes();
            bytes.fill(0);
            std::hint::black_box(&bytes);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().map(|v| v.is_empty()).unwrap_or(true)
    }
}

/// Runs of printable ASCII at least `MIN_FRAGMENT_LEN` long
fn printable_runs(value: &[u8]) -> impl Iterator<Item = &str> {
    value
        .split(|b| !(b.is_ascii_graphic() || *b == b' '))
        .filter(|run| run.len() >= MIN_FRAGMENT_LEN)
        .filter_map(|run| std::str::from_utf8(run).ok())
        .map(str::trim)
        .filter(|run| run.len() >= MIN_FRAGMENT_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_registered_values() {
        let redactor = Redactor::new();
        redactor.register(b"s3cr3t-passphrase");

        let out = redactor.redact("using password s3cr3t-passphrase for p12");
        assert_eq!(out, "using password ****** for p12");
    }

    #[test]
    fn test_redacts_individual_lines_of_multiline_values() {
        let redactor = Redactor::new();
        redactor.register(b"-----BEGIN KEY-----\nMIIEvQIBADANBgkqhkiG9w0BAQEFAASC\n-----END KEY-----\n");

        let out = redactor.redact("line: MIIEvQIBADANBgkqhkiG9w0BAQEFAASC");
        assert!(!out.contains("MIIEvQ"));
    }

    #[test]
    fn test_short_values_are_masked() {
        let redactor = Redactor::new();
        redactor.register(b"42");
        assert_eq!(redactor.redact("pin=42"), "pin=******");

        let redactor = Redactor::new();
        redactor.register(b"7");
        assert_eq!(redactor.redact("code 7"), "code ******");
    }

    #[test]
    fn test_empty_value_registers_nothing() {
        let redactor = Redactor::new();
        redactor.register(b"");
        assert!(redactor.is_empty());
    }

    #[test]
    fn test_binary_values_are_masked() {
        let key: &[u8] = b"\x30\x82\x01\xffMIIsecretkeymaterial\x00\x9fmore-key-bytes";
        let redactor = Redactor::new();
        redactor.register(key);

        let printed = String::from_utf8_lossy(key).to_string();
        let out = redactor.redact(&format!("dump: {}", printed));
        assert!(!out.contains("MIIsecretkeymaterial"));
        assert!(!out.contains("more-key-bytes"));

        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        assert_eq!(redactor.redact(&encoded), "******");

        // A partial print still hides the readable material
        let out = redactor.redact("key=MIIsecretkeymaterial");
        assert_eq!(out, "key=******");
    }

    #[test]
    fn test_clear_forgets_values() {
        let redactor = Redactor::new();
        redactor.register(b"token-123");
        redactor.clear();
        assert!(redactor.is_empty());
        assert_eq!(redactor.redact("token-123"), "token-123");
    }
}
