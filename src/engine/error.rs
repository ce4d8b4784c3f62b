//! LiveUpdate Error Types

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

use super::config::ConfigError;
use super::keystore::KeystoreError;
use super::updater::bundle::BundleStatus;

/// Why an artifact was not trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFailure {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("signature required but bundle is unsigned")]
    MissingSignature,

    #[error("declared size {declared} does not match measured size {measured}")]
    SizeMismatch { declared: u64, measured: u64 },

    #[error("bundle of {size} bytes exceeds limit of {limit} bytes")]
    SizeLimit { size: u64, limit: u64 },

    #[error("untrusted url: {0}")]
    UntrustedUrl(String),

    #[error("unsafe archive entry: {0}")]
    UnsafePath(String),
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityFailure),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid version: {0}")]
    Parse(String),

    #[error("Bundle not found: {0}")]
    NotFound(String),

    #[error("Bundle already staged: {0}")]
    Duplicate(String),

    #[error("Illegal status transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: BundleStatus,
        to: BundleStatus,
    },

    #[error("No fallback bundle available")]
    NoFallback,

    #[error("Bundle {bundle_id} did not report ready within {}ms", timeout.as_millis())]
    ReadinessTimeout {
        bundle_id: String,
        timeout: Duration,
        restored: Option<String>,
    },

    #[error("A check is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, UpdateError>;

impl UpdateError {
    /// Shorthand for a size-limit integrity failure
    pub fn size_limit(size: u64, limit: u64) -> Self {
        Self::Integrity(IntegrityFailure::SizeLimit { size, limit })
    }

    /// Map onto the public taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::AlreadyRunning => ErrorKind::Config,
            Self::Network(_) => ErrorKind::Network,
            Self::Integrity(_) | Self::Parse(_) => ErrorKind::Integrity,
            Self::Storage(_) | Self::Duplicate(_) | Self::InvalidTransition { .. } => {
                ErrorKind::Storage
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoFallback => ErrorKind::NoFallback,
            Self::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
        }
    }

    /// Transient failures that the downloader may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<io::Error> for UpdateError {
    fn from(e: io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {}", e))
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<ConfigError> for UpdateError {
    fn from(e: ConfigError) -> Self {
        Self::InvalidConfig(e.to_string())
    }
}

impl From<KeystoreError> for UpdateError {
    fn from(e: KeystoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Error taxonomy exposed to callers and the notification layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Network,
    Integrity,
    Storage,
    ReadinessTimeout,
    NotFound,
    NoFallback,
}

impl ErrorKind {
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Config => "Update configuration is invalid",
            ErrorKind::Network => "Update server could not be reached",
            ErrorKind::Integrity => "Update failed verification",
            ErrorKind::Storage => "Update could not be stored",
            ErrorKind::ReadinessTimeout => "Update did not start and was rolled back",
            ErrorKind::NotFound => "No installed update found",
            ErrorKind::NoFallback => "No previous update to fall back to",
        }
    }
}

/// Serializable error summary carried in results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&UpdateError> for ErrorInfo {
    fn from(e: &UpdateError) -> Self {
        let kind = e.kind();
        // Transport details stay in the logs.
        let message = match kind {
            ErrorKind::Network => kind.description().to_string(),
            _ => e.to_string(),
        };
        Self { kind, message }
    }
}

impl From<UpdateError> for ErrorInfo {
    fn from(e: UpdateError) -> Self {
        Self::from(&e)
    }
}
