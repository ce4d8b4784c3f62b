//! Update Metadata Source
//!
//! Answers "what is the latest bundle for this version and channel".

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::bundle::BundleManifest;
use super::security::{ChecksumAlgorithm, SecurityValidator};
use super::version::VersionManager;
use crate::engine::config::LiveUpdateConfig;
use crate::engine::error::{IntegrityFailure, Result, UpdateError};

/// Provider of update manifests
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Latest manifest for `channel`, or `None` when nothing is published
    async fn latest(&self, current_version: &str, channel: &str) -> Result<Option<BundleManifest>>;
}

/// `GET {server}/bundles/latest?channel=..&version=..`
pub struct HttpMetadataSource {
    client: reqwest::Client,
    endpoint: String,
    validator: SecurityValidator,
}

impl HttpMetadataSource {
    pub fn new(config: &LiveUpdateConfig, validator: SecurityValidator) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("LiveUpdate-Engine/", env!("CARGO_PKG_VERSION")))
            .timeout(config.download.timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bundles/latest", config.server_url.trim_end_matches('/')),
            validator,
        })
    }

    fn request_url(&self, current_version: &str, channel: &str) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| UpdateError::InvalidConfig(format!("server_url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("channel", channel)
            .append_pair("version", current_version);
        Ok(url)
    }

    /// Reject manifests that could never verify
    fn check_manifest(manifest: &BundleManifest, default_alg: ChecksumAlgorithm) -> Result<()> {
        VersionManager::parse(&manifest.version)?;
        let (_, digest) = ChecksumAlgorithm::split_tagged(&manifest.checksum, default_alg);
        if digest.is_empty() || hex::decode(&digest).is_err() {
            return Err(UpdateError::Parse(format!(
                "malformed checksum for version {}",
                SecurityValidator::sanitize_input(&manifest.version)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn latest(&self, current_version: &str, channel: &str) -> Result<Option<BundleManifest>> {
        let url = self.request_url(current_version, channel)?;
        if !self.validator.validate_url(url.as_str()) {
            return Err(IntegrityFailure::UntrustedUrl(self.endpoint.clone()).into());
        }

        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                debug!(channel, "No bundle published");
                return Ok(None);
            }
            status if !status.is_success() => {
                return Err(UpdateError::Network(format!("metadata endpoint returned {}", status)));
            }
            _ => {}
        }

        let manifest: BundleManifest = response
            .json()
            .await
            .map_err(|e| UpdateError::Parse(format!("manifest: {}", e)))?;
        Self::check_manifest(&manifest, self.validator.policy().checksum_algorithm)?;

        debug!(version = %manifest.version, channel = %manifest.channel, "Fetched manifest");
        Ok(Some(manifest))
    }
}
