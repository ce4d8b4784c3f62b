//! Cryptographic Verification
//!
//! Gatekeeper for every network fetch and every downloaded artifact:
//! transport policy, SHA-256/SHA-512 checksums, Ed25519 signatures, and
//! write-path confinement.

use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

use crate::engine::config::LiveUpdateConfig;
use crate::engine::error::{Result, UpdateError};
use crate::engine::keystore::{KeystoreError, SecureStorage, PUBLIC_KEY_ENTRY};

/// Digest algorithm for bundle checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Parse a name; anything unsupported falls back to SHA-256
    pub fn parse_or_default(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => ChecksumAlgorithm::Sha256,
            "sha512" => ChecksumAlgorithm::Sha512,
            other => {
                warn!(algorithm = %SecurityValidator::sanitize_input(other), "Unsupported checksum algorithm, using sha256");
                ChecksumAlgorithm::Sha256
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }

    /// Split `sha512:abcd` into algorithm and lowercase digest; untagged
    /// digests use `default`.
    pub fn split_tagged(checksum: &str, default: ChecksumAlgorithm) -> (ChecksumAlgorithm, String) {
        match checksum.split_once(':') {
            Some((tag, digest)) => (Self::parse_or_default(tag), digest.trim().to_lowercase()),
            None => (default, checksum.trim().to_lowercase()),
        }
    }

    pub fn digest(&self, payload: &[u8]) -> Vec<u8> {
        match self {
            ChecksumAlgorithm::Sha256 => Sha256::digest(payload).to_vec(),
            ChecksumAlgorithm::Sha512 => Sha512::digest(payload).to_vec(),
        }
    }
}

impl From<String> for ChecksumAlgorithm {
    fn from(name: String) -> Self {
        Self::parse_or_default(&name)
    }
}

impl From<ChecksumAlgorithm> for String {
    fn from(algorithm: ChecksumAlgorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

/// Immutable per-session security policy
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub enforce_https: bool,
    /// Lowercase host names; empty means any host
    pub allowed_hosts: Vec<String>,
    pub require_signature: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub max_bundle_size: u64,
}

impl SecurityPolicy {
    /// Derive the policy; the server host is always allowed
    pub fn from_config(config: &LiveUpdateConfig) -> Self {
        let mut allowed_hosts: Vec<String> = Vec::new();
        if let Some(host) = Url::parse(&config.server_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        {
            allowed_hosts.push(host);
        }
        for host in &config.security.allowed_hosts {
            let host = host.trim().to_ascii_lowercase();
            if !host.is_empty() && !allowed_hosts.contains(&host) {
                allowed_hosts.push(host);
            }
        }

        Self {
            enforce_https: config.security.enforce_https,
            allowed_hosts,
            require_signature: config.security.require_signature,
            checksum_algorithm: config.security.checksum_algorithm,
            max_bundle_size: config.security.max_bundle_size,
        }
    }
}

/// Validator for URLs, artifacts and write paths
#[derive(Clone)]
pub struct SecurityValidator {
    policy: SecurityPolicy,
    public_key: Option<VerifyingKey>,
    writable_roots: Vec<PathBuf>,
}

impl SecurityValidator {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            public_key: None,
            writable_roots: Vec::new(),
        }
    }

    /// Build from config. A configured key must parse; otherwise the key is
    /// looked up in `storage`.
    pub fn from_config(
        config: &LiveUpdateConfig,
        storage: Option<&dyn SecureStorage>,
    ) -> Result<Self> {
        let mut validator = Self::new(SecurityPolicy::from_config(config));
        match (&config.security.public_key, storage) {
            (Some(key), _) => {
                validator.public_key = Some(Self::parse_public_key(key).ok_or_else(|| {
                    UpdateError::InvalidConfig("security.public_key is not a valid Ed25519 key".into())
                })?);
            }
            (None, Some(storage)) => validator.load_public_key(storage)?,
            (None, None) => {}
        }
        Ok(validator)
    }

    pub fn with_public_key(mut self, key: VerifyingKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn with_writable_root(mut self, root: &Path) -> Self {
        self.writable_roots.push(root.to_path_buf());
        self
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn has_public_key(&self) -> bool {
        self.public_key.is_some()
    }

    /// Read the verification key from secure storage; a missing entry is not an error
    pub fn load_public_key(&mut self, storage: &dyn SecureStorage) -> Result<()> {
        match storage.get(PUBLIC_KEY_ENTRY) {
            Ok(encoded) => {
                let key = Self::parse_public_key(&encoded).ok_or_else(|| {
                    UpdateError::InvalidConfig("stored public key is not a valid Ed25519 key".into())
                })?;
                self.public_key = Some(key);
                Ok(())
            }
            Err(KeystoreError::NotFound(_)) => {
                debug!("No bundle public key in secure storage");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept only policy-conforming URLs
    pub fn validate_url(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match parsed.scheme() {
            "https" => {}
            "http" if !self.policy.enforce_https => {}
            _ => return false,
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        if self.policy.allowed_hosts.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.policy.allowed_hosts.iter().any(|allowed| *allowed == host)
    }

    /// Hex digest of `payload`
    pub fn compute_checksum(payload: &[u8], algorithm: ChecksumAlgorithm) -> String {
        hex::encode(algorithm.digest(payload))
    }

    /// Compare a payload against an expected hex digest (case-insensitive)
    pub fn checksum_matches(payload: &[u8], expected: &str, algorithm: ChecksumAlgorithm) -> bool {
        Self::compute_checksum(payload, algorithm).eq_ignore_ascii_case(expected.trim())
    }

    /// Verify `signature` over the hash of `payload` with an explicit key.
    /// Any malformed input yields `false`.
    pub fn verify_signature(&self, payload: &[u8], signature: &str, public_key: &str) -> bool {
        let Some(key) = Self::parse_public_key(public_key) else {
            return false;
        };
        let digest = self.policy.checksum_algorithm.digest(payload);
        Self::verify_digest(&key, &digest, signature)
    }

    /// Verify a detached signature over a hex digest with the configured key
    pub fn verify_checksum_signature(&self, checksum_hex: &str, signature: &str) -> bool {
        let Some(key) = &self.public_key else {
            return false;
        };
        let Ok(digest) = hex::decode(checksum_hex.trim()) else {
            return false;
        };
        Self::verify_digest(key, &digest, signature)
    }

    fn verify_digest(key: &VerifyingKey, digest: &[u8], signature: &str) -> bool {
        let Some(bytes) = decode_flexible(signature) else {
            return false;
        };
        let Ok(sig_array) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_array);
        key.verify(digest, &signature).is_ok()
    }

    fn parse_public_key(encoded: &str) -> Option<VerifyingKey> {
        let bytes = decode_flexible(encoded)?;
        let key_array = <[u8; 32]>::try_from(bytes.as_slice()).ok()?;
        VerifyingKey::from_bytes(&key_array).ok()
    }

    /// Reject traversal and anything outside the writable roots
    pub fn validate_path(&self, path: &Path) -> bool {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return false;
        }
        self.writable_roots.iter().any(|root| path.starts_with(root) && path != root.as_path())
    }

    /// Keep only `[A-Za-z0-9._-]`
    pub fn sanitize_input(text: &str) -> String {
        text.chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .collect()
    }
}

/// Hex first, then standard base64
fn decode_flexible(encoded: &str) -> Option<Vec<u8>> {
    let trimmed = encoded.trim();
    hex::decode(trimmed)
        .ok()
        .or_else(|| base64::engine::general_purpose::STANDARD.decode(trimmed).ok())
}
