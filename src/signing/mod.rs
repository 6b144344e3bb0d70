// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Signed vs. unsigned packaging
//!
//! The presence of a provisioning profile in the secret store decides the
//! packaging path. No profile means an unsigned archive and no further secret
//! lookups; a profile means every signing secret must resolve before any
//! signed step runs.

mod profile;

pub use profile::extract_profile_name;

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{StagehandError, StagehandResult};
use crate::pipeline::Packaging;
use crate::secrets::{Secret, SecretResolver};

/// Identity used when the pipeline sets none
pub const DEFAULT_CODE_SIGN_IDENTITY: &str = "Apple Distribution";

/// Which branch ran, as recorded on the build run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackagingDecision {
    Unsigned,
    Signed,
}

impl std::fmt::Display for PackagingDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsigned => write!(f, "unsigned"),
            Self::Signed => write!(f, "signed"),
        }
    }
}

/// Everything the signed packaging steps need
#[derive(Debug)]
pub struct SigningIdentity {
    pub profile: Arc<Secret>,
    pub profile_name: String,
    pub team_id: Arc<Secret>,
    pub bundle_id: Arc<Secret>,
    pub passphrase: Arc<Secret>,
    pub code_sign_identity: String,
}

impl SigningIdentity {
    /// Variables handed to signed steps; the profile is written to a run-local file
    pub fn step_env(&self, resolver: &SecretResolver) -> StagehandResult<Vec<(String, String)>> {
        let profile_path = resolver.materialize_file(&self.profile)?;

        Ok(vec![
            ("SIGN_BUNDLE_IDENTIFIER".into(), text(&self.bundle_id)),
            ("SIGN_CODE_SIGN_IDENTITY".into(), self.code_sign_identity.clone()),
            ("SIGN_CERTIFICATE_PASSWORD".into(), text(&self.passphrase)),
            ("SIGN_PROVISIONING_PROFILE_NAME".into(), self.profile_name.clone()),
            ("SIGN_TEAM_ID".into(), text(&self.team_id)),
            (
                "SIGN_PROVISIONING_PROFILE_PATH".into(),
                profile_path.to_string_lossy().to_string(),
            ),
        ])
    }
}

fn text(secret: &Secret) -> String {
    secret.value.expose_str().unwrap_or_default().to_string()
}

/// A signing secret that resolves but cannot be used counts as not found
fn unusable_as_not_found(err: StagehandError) -> StagehandError {
    match err {
        StagehandError::SecretDecode { secret, reason } => {
            warn!(secret = %secret, reason = %reason, "signing secret unusable");
            StagehandError::SecretNotFound { secret }
        }
        other => other,
    }
}

/// The selected packaging branch
#[derive(Debug)]
pub enum PackagingPath {
    Unsigned,
    Signed(SigningIdentity),
}

impl PackagingPath {
    pub fn decision(&self) -> PackagingDecision {
        match self {
            Self::Unsigned => PackagingDecision::Unsigned,
            Self::Signed(_) => PackagingDecision::Signed,
        }
    }
}

/// Decides the packaging path of one stage
pub struct BranchEvaluator<'a> {
    packaging: &'a Packaging,
    code_sign_identity: String,
}

impl<'a> BranchEvaluator<'a> {
    pub fn new(packaging: &'a Packaging, code_sign_identity: impl Into<String>) -> Self {
        Self {
            packaging,
            code_sign_identity: code_sign_identity.into(),
        }
    }

    pub async fn evaluate(&self, resolver: &SecretResolver) -> StagehandResult<PackagingPath> {
        let profile_id = self.packaging.profile_secret.as_str();

        let profile = match resolver
            .resolve_optional(profile_id)
            .await
            .map_err(unusable_as_not_found)?
        {
            Some(profile) if !profile.value.is_empty() => profile,
            _ => {
                info!(secret = profile_id, "provisioning profile absent, packaging unsigned");
                return Ok(PackagingPath::Unsigned);
            }
        };

        let [team_id, bundle_id, passphrase] = self.packaging.signing_secret_ids();
        let (team_id, bundle_id, passphrase) = tokio::try_join!(
            resolver.resolve_text(team_id),
            resolver.resolve_text(bundle_id),
            resolver.resolve_text(passphrase),
        )
        .map_err(unusable_as_not_found)?;

        let profile_name = extract_profile_name(profile.value.expose()).ok_or_else(|| {
            warn!(secret = profile_id, "no Name entry in the provisioning profile");
            StagehandError::SecretNotFound {
                secret: profile_id.to_string(),
            }
        })?;

        info!(secret = profile_id, "provisioning profile present, packaging signed");
        Ok(PackagingPath::Signed(SigningIdentity {
            profile,
            profile_name,
            team_id,
            bundle_id,
            passphrase,
            code_sign_identity: self.code_sign_identity.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{DecodeMode, StaticSecretStore};
    use std::collections::BTreeMap;

    const PROFILE: &[u8] =
        b"\x30\x80<plist><dict><key>Name</key><string>Nodulus Distribution</string></dict></plist>\x00";

    fn packaging() -> Packaging {
        serde_yaml::from_str("signed: []\nunsigned: []\n").unwrap()
    }

    fn modes() -> BTreeMap<String, DecodeMode> {
        let base64 = DecodeMode::Base64 {
            field: "SecretBinary".into(),
        };
        let json = |key: &str| DecodeMode::Text {
            field: "SecretString".into(),
            key: Some(key.into()),
        };
        BTreeMap::from([
            ("PROVISIONING_PROFILE".to_string(), base64),
            ("TEAM_ID".to_string(), json("TEAM_ID")),
            ("APP_BUNDLE".to_string(), json("APP_BUNDLE")),
            (
                "SIGNING_CERT_PRIV_KEY_PASSPHRASE".to_string(),
                json("SIGNING_CERT_PRIV_KEY_PASSPHRASE"),
            ),
        ])
    }

    fn signing_store() -> StaticSecretStore {
        StaticSecretStore::new()
            .with_string("TEAM_ID", r#"{"TEAM_ID":"ABCDE12345"}"#)
            .with_string("APP_BUNDLE", r#"{"APP_BUNDLE":"com.example.nodulus"}"#)
            .with_string(
                "SIGNING_CERT_PRIV_KEY_PASSPHRASE",
                r#"{"SIGNING_CERT_PRIV_KEY_PASSPHRASE":"p12-passphrase"}"#,
            )
    }

    #[tokio::test]
    async fn test_absent_profile_is_unsigned_without_other_lookups() {
        let store = Arc::new(signing_store());
        let resolver = SecretResolver::new("run-1", store.clone(), modes());
        let packaging = packaging();

        let path = BranchEvaluator::new(&packaging, DEFAULT_CODE_SIGN_IDENTITY)
            .evaluate(&resolver)
            .await
            .unwrap();

        assert_eq!(path.decision(), PackagingDecision::Unsigned);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_profile_is_unsigned() {
        let store = Arc::new(signing_store().with_binary("PROVISIONING_PROFILE", b""));
        let resolver = SecretResolver::new("run-1", store, modes());
        let packaging = packaging();

        let path = BranchEvaluator::new(&packaging, DEFAULT_CODE_SIGN_IDENTITY)
            .evaluate(&resolver)
            .await
            .unwrap();
        assert_eq!(path.decision(), PackagingDecision::Unsigned);
    }

    #[tokio::test]
    async fn test_present_profile_resolves_full_identity() {
        let store = Arc::new(signing_store().with_binary("PROVISIONING_PROFILE", PROFILE));
        let resolver = SecretResolver::new("run-1", store, modes());
        let packaging = packaging();

        let path = BranchEvaluator::new(&packaging, "Apple Development")
            .evaluate(&resolver)
            .await
            .unwrap();

        let PackagingPath::Signed(identity) = path else {
            panic!("expected signed path");
        };
        assert_eq!(identity.profile_name, "Nodulus Distribution");
        assert_eq!(identity.team_id.value.expose_str(), Some("ABCDE12345"));

        let env: BTreeMap<String, String> =
            identity.step_env(&resolver).unwrap().into_iter().collect();
        assert_eq!(env["SIGN_BUNDLE_IDENTIFIER"], "com.example.nodulus");
        assert_eq!(env["SIGN_CODE_SIGN_IDENTITY"], "Apple Development");
        assert_eq!(env["SIGN_CERTIFICATE_PASSWORD"], "p12-passphrase");
        assert_eq!(
            std::fs::read(&env["SIGN_PROVISIONING_PROFILE_PATH"]).unwrap(),
            PROFILE
        );
    }

    #[tokio::test]
    async fn test_present_profile_with_missing_secret_fails() {
        let store = Arc::new(
            StaticSecretStore::new()
                .with_binary("PROVISIONING_PROFILE", PROFILE)
                .with_string("TEAM_ID", r#"{"TEAM_ID":"ABCDE12345"}"#)
                .with_string("APP_BUNDLE", r#"{"APP_BUNDLE":"com.example.nodulus"}"#),
        );
        let resolver = SecretResolver::new("run-1", store, modes());
        let packaging = packaging();

        let err = BranchEvaluator::new(&packaging, DEFAULT_CODE_SIGN_IDENTITY)
            .evaluate(&resolver)
            .await
            .unwrap_err();
        assert!(err.is_secret_not_found());
        assert!(err.to_string().contains("SIGNING_CERT_PRIV_KEY_PASSPHRASE"));
    }

    #[tokio::test]
    async fn test_profile_without_name_is_secret_not_found() {
        let store = Arc::new(signing_store().with_binary("PROVISIONING_PROFILE", b"not a plist"));
        let resolver = SecretResolver::new("run-1", store, modes());
        let packaging = packaging();

        let err = BranchEvaluator::new(&packaging, DEFAULT_CODE_SIGN_IDENTITY)
            .evaluate(&resolver)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StagehandError::SecretNotFound { ref secret } if secret == "PROVISIONING_PROFILE"
        ));
    }

    #[tokio::test]
    async fn test_undecodable_signing_secret_is_secret_not_found() {
        let store = Arc::new(
            StaticSecretStore::new()
                .with_binary("PROVISIONING_PROFILE", PROFILE)
                .with_string("TEAM_ID", r#"{"TEAM_ID":"ABCDE12345"}"#)
                .with_string("APP_BUNDLE", r#"{"APP_BUNDLE":"com.example.nodulus"}"#)
                .with_binary("SIGNING_CERT_PRIV_KEY_PASSPHRASE", b"\xff\xfe\x00"),
        );
        let mut modes = modes();
        modes.insert(
            "SIGNING_CERT_PRIV_KEY_PASSPHRASE".into(),
            DecodeMode::Base64 {
                field: "SecretBinary".into(),
            },
        );
        let resolver = SecretResolver::new("run-1", store, modes);
        let packaging = packaging();

        let err = BranchEvaluator::new(&packaging, DEFAULT_CODE_SIGN_IDENTITY)
            .evaluate(&resolver)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StagehandError::SecretNotFound { ref secret }
                if secret == "SIGNING_CERT_PRIV_KEY_PASSPHRASE"
        ));
    }
}
