// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Artifact rule parsing
//!
//! Publish rules read `<source> => <artifact>[/<subdir>]`; consume rules read
//! `<artifact> => <dest>` or `<artifact>!<pattern> => <dest>`.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::StagehandError;

const ARROW: &str = "=>";

/// Left-hand side of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Workspace path (publish) or artifact name (consume); may contain glob characters
    Path(String),
    /// Entries of a published artifact selected by a glob pattern
    Archive { archive: String, pattern: String },
}

/// A parsed `source => destination` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRule {
    source: RuleSource,
    destination: String,
}

impl ArtifactRule {
    pub fn parse(rule: &str) -> Result<Self, StagehandError> {
        let invalid = |reason: &str| StagehandError::InvalidArtifactRule {
            rule: rule.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, rhs) = rule
            .split_once(ARROW)
            .ok_or_else(|| invalid("missing '=>'"))?;
        let (lhs, rhs) = (lhs.trim(), rhs.trim());

        if rhs.contains(ARROW) {
            return Err(invalid("more than one '=>'"));
        }
        if lhs.is_empty() {
            return Err(invalid("empty source"));
        }
        if rhs.is_empty() {
            return Err(invalid("empty destination"));
        }
        if !is_contained(Path::new(rhs)) {
            return Err(invalid("destination must be a relative path without '..'"));
        }

        let source = match lhs.split_once('!') {
            Some((archive, pattern)) => {
                let (archive, pattern) = (archive.trim(), pattern.trim());
                if archive.is_empty() || pattern.is_empty() {
                    return Err(invalid("archive rules need both a name and a pattern"));
                }
                glob::Pattern::new(pattern).map_err(|e| invalid(&e.to_string()))?;
                RuleSource::Archive {
                    archive: archive.to_string(),
                    pattern: pattern.to_string(),
                }
            }
            None => {
                if !is_contained(Path::new(lhs)) {
                    return Err(invalid("source must be a relative path without '..'"));
                }
                RuleSource::Path(lhs.to_string())
            }
        };

        Ok(Self {
            source,
            destination: rhs.to_string(),
        })
    }

    pub fn source(&self) -> &RuleSource {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether a consume rule extracts straight into the workspace root
    pub fn extracts_into_root(&self) -> bool {
        !Path::new(&self.destination)
            .components()
            .any(|c| matches!(c, Component::Normal(_)))
    }

    /// Whether this rule can publish (archive selectors only make sense on consume)
    pub fn is_publishable(&self) -> bool {
        matches!(self.source, RuleSource::Path(_))
    }

    /// Artifact a publish rule writes to, and the sub-directory inside it
    pub fn publish_target(&self) -> (String, PathBuf) {
        split_path(&self.destination)
    }

    /// Artifact a consume rule reads from
    pub fn consumed_artifact(&self) -> String {
        match &self.source {
            RuleSource::Archive { archive, .. } => archive.clone(),
            RuleSource::Path(path) => split_path(path).0,
        }
    }
}

impl FromStr for ArtifactRule {
    type Err = StagehandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ArtifactRule {
    type Error = StagehandError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactRule> for String {
    fn from(rule: ArtifactRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for ArtifactRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            RuleSource::Path(path) => write!(f, "{} => {}", path, self.destination),
            RuleSource::Archive { archive, pattern } => {
                write!(f, "{}!{} => {}", archive, pattern, self.destination)
            }
        }
    }
}

/// Relative, and never climbs out of its base
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

pub(super) fn split_path(path: &str) -> (String, PathBuf) {
    let mut components = Path::new(path)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)));
    let first = components
        .next()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .unwrap_or_default();
    (first, components.collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish_rule() {
        let rule = ArtifactRule::parse("Nodulus/iOSProj => XcodeProject.zip").unwrap();
        assert_eq!(rule.source(), &RuleSource::Path("Nodulus/iOSProj".into()));
        assert_eq!(rule.destination(), "XcodeProject.zip");
        assert_eq!(
            rule.publish_target(),
            ("XcodeProject.zip".to_string(), PathBuf::new())
        );
    }

    #[test]
    fn test_parse_archive_rule() {
        let rule: ArtifactRule = "XcodeProject.zip!** => .".parse().unwrap();
        assert_eq!(
            rule.source(),
            &RuleSource::Archive {
                archive: "XcodeProject.zip".into(),
                pattern: "**".into()
            }
        );
        assert_eq!(rule.consumed_artifact(), "XcodeProject.zip");
        assert!(!rule.is_publishable());
        assert!(rule.extracts_into_root());
        assert!(!ArtifactRule::parse("pkg.zip!** => in").unwrap().extracts_into_root());
        assert_eq!(rule.to_string(), "XcodeProject.zip!** => .");
    }

    #[test]
    fn test_publish_into_artifact_subdirectory() {
        let rule = ArtifactRule::parse("build/logs => Logs.zip/unity").unwrap();
        assert_eq!(
            rule.publish_target(),
            ("Logs.zip".to_string(), PathBuf::from("unity"))
        );
    }

    #[test]
    fn test_rejects_malformed_rules() {
        for bad in [
            "no arrow",
            "=> dest",
            "src =>",
            "a => b => c",
            "!** => .",
            "pkg.zip! => .",
            "src => ../escape",
            "/etc/passwd => stolen.zip",
        ] {
            let err = ArtifactRule::parse(bad).unwrap_err();
            assert!(
                matches!(err, StagehandError::InvalidArtifactRule { .. }),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_serde_uses_rule_syntax() {
        let rules: Vec<ArtifactRule> =
            serde_yaml::from_str("- \"out/pkg => pkg.zip\"\n- \"pkg.zip!** => in\"\n").unwrap();
        assert_eq!(rules.len(), 2);
        let yaml = serde_yaml::to_string(&rules).unwrap();
        assert!(yaml.contains("out/pkg => pkg.zip"));
    }
}
