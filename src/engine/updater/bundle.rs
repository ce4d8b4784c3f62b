//! Bundle Records
//!
//! Bundle metadata, the status state machine, and the manifest shape served by
//! the update-metadata endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::security::{ChecksumAlgorithm, SecurityValidator};

/// Lifecycle of a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleStatus {
    /// Candidate from a check; only held in memory
    Pending,
    /// Fetch in flight
    Downloading,
    /// Fetched, not yet verified
    Downloaded,
    Verified,
    /// Currently serving the app
    Active,
    /// Previously active, retained for rollback
    Superseded,
    Failed,
    RolledBack,
}

impl BundleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BundleStatus::Failed | BundleStatus::RolledBack)
    }

    /// Legal transitions. Failure states are reachable from any non-terminal
    /// state; `Superseded -> Active` is the rollback path.
    pub fn can_transition_to(&self, next: BundleStatus) -> bool {
        use BundleStatus::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | RolledBack => true,
            Downloading => *self == Pending,
            Downloaded => *self == Downloading,
            Verified => *self == Downloaded,
            Active => matches!(self, Verified | Superseded),
            Superseded => *self == Active,
            Pending => false,
        }
    }
}

/// Manifest returned by the update-metadata source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub version: String,
    pub url: String,
    /// Hex digest, optionally tagged (`sha512:...`)
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_binary_version: Option<String>,
}

impl BundleManifest {
    /// Server id when present, else derived from version and digest
    pub fn bundle_id(&self, default_algorithm: ChecksumAlgorithm) -> String {
        let raw = match &self.id {
            Some(id) => id.clone(),
            None => {
                let (_, digest) = ChecksumAlgorithm::split_tagged(&self.checksum, default_algorithm);
                let short = &digest[..digest.len().min(12)];
                format!("{}-{}", self.version, short)
            }
        };
        SecurityValidator::sanitize_input(&raw)
    }
}

/// A unit of deployable code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub version: String,
    pub channel: String,
    pub checksum: String,
    pub checksum_algorithm: ChecksumAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub size_bytes: u64,
    pub status: BundleStatus,
    /// Staged artifact on durable storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_binary_version: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Bundle {
    /// A candidate known only by its manifest
    pub fn pending(manifest: &BundleManifest, default_algorithm: ChecksumAlgorithm) -> Self {
        let (algorithm, digest) =
            ChecksumAlgorithm::split_tagged(&manifest.checksum, default_algorithm);
        Self {
            id: manifest.bundle_id(default_algorithm),
            version: manifest.version.clone(),
            channel: manifest.channel.clone(),
            checksum: digest,
            checksum_algorithm: algorithm,
            signature: manifest.signature.clone(),
            size_bytes: manifest.size.unwrap_or(0),
            status: BundleStatus::Pending,
            location: None,
            source_url: Some(manifest.url.clone()),
            min_binary_version: manifest.min_binary_version.clone(),
            created_at: Utc::now(),
            activated_at: None,
            failure_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == BundleStatus::Active
    }
}

/// Outcome of `LiveUpdateEngine::check_for_update`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub available: bool,
    pub latest: Option<Bundle>,
    pub current_version: String,
    pub error: Option<crate::engine::error::ErrorInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use BundleStatus::*;

    fn manifest() -> BundleManifest {
        BundleManifest {
            id: None,
            version: "1.0.1".to_string(),
            url: "https://cdn.example.com/b.tar.gz".to_string(),
            checksum: "sha512:ABCDEF0123456789abcdef".to_string(),
            signature: None,
            channel: "production".to_string(),
            size: Some(42),
            min_binary_version: None,
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Downloaded));
        assert!(Downloaded.can_transition_to(Verified));
        assert!(Verified.can_transition_to(Active));
        assert!(Active.can_transition_to(Superseded));
        assert!(Superseded.can_transition_to(Active));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Downloaded.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Verified));
        assert!(!Verified.can_transition_to(Downloaded));
        assert!(!Failed.can_transition_to(Verified));
        assert!(!RolledBack.can_transition_to(Active));
    }

    #[test]
    fn test_failure_reachable_from_non_terminal() {
        for status in [Pending, Downloading, Downloaded, Verified, Active, Superseded] {
            assert!(status.can_transition_to(Failed));
            assert!(status.can_transition_to(RolledBack));
        }
    }

    #[test]
    fn test_pending_bundle_from_manifest() {
        let bundle = Bundle::pending(&manifest(), ChecksumAlgorithm::Sha256);
        assert_eq!(bundle.status, Pending);
        assert_eq!(bundle.checksum_algorithm, ChecksumAlgorithm::Sha512);
        assert_eq!(bundle.checksum, "abcdef0123456789abcdef");
        assert_eq!(bundle.id, "1.0.1-abcdef012345");
        assert_eq!(bundle.size_bytes, 42);
    }

    #[test]
    fn test_server_id_is_sanitized() {
        let mut m = manifest();
        m.id = Some("../../etc/passwd".to_string());
        let id = m.bundle_id(ChecksumAlgorithm::Sha256);
        assert!(!id.contains('/'));
    }
}
