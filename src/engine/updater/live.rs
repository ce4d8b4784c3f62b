//! Live Update Engine
//!
//! One update cycle: query latest -> download -> validate -> stage ->
//! activate -> await ready -> commit or roll back.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::bundle::{Bundle, BundleStatus, UpdateCheckResult};
use super::download::Downloader;
use super::readiness::{ProvisionalState, ReadinessTracker, ReadyOutcome};
use super::security::SecurityValidator;
use super::source::{HttpMetadataSource, MetadataSource};
use super::store::BundleStore;
use super::version::VersionManager;
use crate::engine::config::LiveUpdateConfig;
use crate::engine::error::{ErrorInfo, IntegrityFailure, Result, UpdateError};
use crate::engine::keystore::SecureStorage;
use crate::engine::metrics::{Metrics, MetricsCollector, UpdateOutcome};
use crate::engine::scheduler::{LiveUpdateCheck, LiveUpdateInfo};

/// What `recover_on_launch` found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Nothing awaiting confirmation
    Stable,
    /// Still provisional; the host should signal ready once started
    Provisional { bundle_id: String, launch_attempts: u32 },
    /// Too many unconfirmed launches; `restored` is `None` for the embedded bundle
    RolledBack { from: String, restored: Option<String> },
}

pub struct LiveUpdateEngine {
    config: LiveUpdateConfig,
    store: Arc<BundleStore>,
    validator: SecurityValidator,
    source: Arc<dyn MetadataSource>,
    downloader: Downloader,
    readiness: ReadinessTracker,
    metrics: MetricsCollector,
}

impl LiveUpdateEngine {
    /// Open against the configured HTTP metadata server
    pub fn open(config: LiveUpdateConfig, key_storage: Option<&dyn SecureStorage>) -> Result<Self> {
        let validator = SecurityValidator::from_config(&config, key_storage)?;
        let source = Arc::new(HttpMetadataSource::new(&config, validator.clone())?);
        Self::with_source(config, key_storage, source)
    }

    /// Open with a caller-supplied metadata source
    pub fn with_source(
        config: LiveUpdateConfig,
        key_storage: Option<&dyn SecureStorage>,
        source: Arc<dyn MetadataSource>,
    ) -> Result<Self> {
        config.validate()?;
        let root = config.storage_root()?;
        let validator = SecurityValidator::from_config(&config, key_storage)?;
        if config.security.require_signature && !validator.has_public_key() {
            warn!("Signatures required but no public key available; every bundle will be rejected");
        }

        let store = Arc::new(BundleStore::open(&root, validator.clone())?);
        let readiness = ReadinessTracker::open(&root)?;
        let metrics = MetricsCollector::new(&root);
        let downloader = Downloader::new(config.download.clone())?;

        Ok(Self {
            validator: validator.with_writable_root(&root),
            config,
            store,
            source,
            downloader,
            readiness,
            metrics,
        })
    }

    pub fn config(&self) -> &LiveUpdateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BundleStore> {
        &self.store
    }

    /// Version the app is running: the active bundle, else the embedded one
    pub fn current_version(&self) -> String {
        self.store
            .current()
            .map(|b| b.version)
            .unwrap_or_else(|_| self.config.embedded_version.clone())
    }

    /// Directory the host should load, `None` for the embedded bundle
    pub fn load_path(&self) -> Option<PathBuf> {
        self.store.current().ok().map(|b| self.store.load_path(&b.id))
    }

    /// Recorded update outcomes
    pub fn metrics(&self) -> Result<Metrics> {
        self.metrics.load()
    }

    // ========== Check ==========

    /// Ask the metadata source for something newer. Never downloads.
    pub async fn check_for_update(&self) -> UpdateCheckResult {
        let current_version = self.current_version();
        match self.find_candidate(&current_version).await {
            Ok(latest) => UpdateCheckResult {
                available: latest.is_some(),
                latest,
                current_version,
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "Update check failed");
                UpdateCheckResult {
                    available: false,
                    latest: None,
                    current_version,
                    error: Some(ErrorInfo::from(&e)),
                }
            }
        }
    }

    async fn find_candidate(&self, current_version: &str) -> Result<Option<Bundle>> {
        let channel = &self.config.channel;
        let Some(manifest) = self.source.latest(current_version, channel).await? else {
            return Ok(None);
        };

        if manifest.channel != *channel {
            debug!(
                candidate_channel = %SecurityValidator::sanitize_input(&manifest.channel),
                "Ignoring bundle from another channel"
            );
            return Ok(None);
        }

        match VersionManager::compare(&manifest.version, current_version)? {
            Ordering::Greater => {}
            Ordering::Equal => return Ok(None),
            Ordering::Less if self.config.allow_downgrade => {
                info!(version = %manifest.version, current = current_version, "Offering downgrade");
            }
            Ordering::Less => {
                debug!(version = %manifest.version, current = current_version, "Ignoring downgrade");
                return Ok(None);
            }
        }

        if !VersionManager::is_compatible(
            manifest.min_binary_version.as_deref(),
            &self.config.binary_version,
        )? {
            info!(
                version = %manifest.version,
                binary_version = %self.config.binary_version,
                "Bundle requires a newer binary"
            );
            return Ok(None);
        }

        let candidate = Bundle::pending(&manifest, self.validator.policy().checksum_algorithm);
        if self.was_rolled_back(&candidate)? {
            debug!(bundle_id = %candidate.id, version = %candidate.version, "Ignoring rolled-back bundle");
            return Ok(None);
        }
        debug!(bundle_id = %candidate.id, version = %candidate.version, "Update available");
        Ok(Some(candidate))
    }

    /// A release that already failed readiness is never offered again
    fn was_rolled_back(&self, candidate: &Bundle) -> Result<bool> {
        Ok(self.store.list()?.iter().any(|b| {
            b.status == BundleStatus::RolledBack
                && (b.id == candidate.id
                    || (b.version == candidate.version && b.channel == candidate.channel))
        }))
    }

    // ========== Download ==========

    /// Fetch and stage a candidate. A checksum or size mismatch discards the
    /// artifact and is never retried.
    pub async fn download(&self, candidate: &Bundle) -> Result<Bundle> {
        if let Ok(existing) = self.store.get(&candidate.id) {
            if matches!(existing.status, BundleStatus::Downloaded | BundleStatus::Verified) {
                debug!(bundle_id = %existing.id, "Bundle already staged");
                return Ok(existing);
            }
        }

        let url = candidate
            .source_url
            .as_deref()
            .ok_or_else(|| UpdateError::NotFound(format!("download url for {}", candidate.id)))?;
        if !self.validator.validate_url(url) {
            warn!(bundle_id = %candidate.id, "Refusing download from untrusted url");
            return Err(IntegrityFailure::UntrustedUrl(url.to_string()).into());
        }

        let max_size = self.validator.policy().max_bundle_size;
        if candidate.size_bytes > max_size {
            return Err(UpdateError::size_limit(candidate.size_bytes, max_size));
        }

        let started = Instant::now();
        let record = self.store.begin_download(candidate)?;
        info!(bundle_id = %record.id, version = %record.version, "Downloading bundle");
        let downloaded = match self
            .downloader
            .download(url, max_size, |done, total| {
                debug!(downloaded = done, total, "Download progress");
            })
            .await
        {
            Ok(downloaded) => downloaded,
            Err(e) => return Err(self.abandon(&record, e)),
        };
        let bytes = downloaded.bytes;

        let staged = match self.store.stage(&bytes, &record) {
            Ok(staged) => staged,
            Err(e) => return Err(self.abandon(&record, e)),
        };

        let measured = bytes.len() as u64;
        let failure = if candidate.size_bytes != 0 && candidate.size_bytes != measured {
            Some(IntegrityFailure::SizeMismatch {
                declared: candidate.size_bytes,
                measured,
            })
        } else {
            self.checksum_failure(&bytes, &staged)
        };
        if let Some(failure) = failure {
            self.reject(&staged, failure.clone(), started);
            return Err(failure.into());
        }

        debug!(bundle_id = %staged.id, attempts = downloaded.attempts, size = measured, "Bundle staged");
        Ok(staged)
    }

    /// Close out an in-flight record that never reached staging
    fn abandon(&self, record: &Bundle, error: UpdateError) -> UpdateError {
        warn!(bundle_id = %record.id, error = %error, "Download failed");
        if let Err(e) = self.store.mark_failed(&record.id, &error.to_string()) {
            warn!(bundle_id = %record.id, error = %e, "Could not mark download failed");
        }
        error
    }

    fn checksum_failure(&self, bytes: &[u8], bundle: &Bundle) -> Option<IntegrityFailure> {
        let actual = SecurityValidator::compute_checksum(bytes, bundle.checksum_algorithm);
        if actual.eq_ignore_ascii_case(bundle.checksum.trim()) {
            None
        } else {
            Some(IntegrityFailure::ChecksumMismatch {
                expected: bundle.checksum.clone(),
                actual,
            })
        }
    }

    /// Mark failed, drop the bytes and record the attempt
    fn reject(&self, bundle: &Bundle, failure: IntegrityFailure, started: Instant) {
        warn!(bundle_id = %bundle.id, reason = %failure, "Rejecting bundle");
        if let Err(e) = self.store.discard(&bundle.id, &failure.to_string()) {
            warn!(bundle_id = %bundle.id, error = %e, "Could not discard bundle");
        }
        self.record(UpdateOutcome {
            from_version: &self.current_version(),
            to_version: &bundle.version,
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            rollback_triggered: false,
            error: Some(failure.to_string()),
        });
    }

    // ========== Validate ==========

    /// Recompute the checksum and check the signature policy
    pub fn validate(&self, bundle: &Bundle) -> Result<Bundle> {
        let started = Instant::now();
        let record = self.store.get(&bundle.id)?;
        let bytes = self.store.read_artifact(&record.id)?;

        if let Some(failure) = self.checksum_failure(&bytes, &record) {
            self.reject(&record, failure.clone(), started);
            return Err(failure.into());
        }

        let require = self.validator.policy().require_signature;
        let failure = match &record.signature {
            None if require => Some(IntegrityFailure::MissingSignature),
            None => None,
            Some(signature) if self.validator.has_public_key() => {
                if self
                    .validator
                    .verify_checksum_signature(&record.checksum, signature)
                {
                    None
                } else {
                    Some(IntegrityFailure::InvalidSignature)
                }
            }
            Some(_) if require => Some(IntegrityFailure::InvalidSignature),
            Some(_) => {
                warn!(bundle_id = %record.id, "No public key configured, signature not checked");
                None
            }
        };
        if let Some(failure) = failure {
            self.reject(&record, failure.clone(), started);
            return Err(failure.into());
        }

        self.store.mark_verified(&record.id)
    }

    // ========== Apply ==========

    /// Activate a verified bundle. It stays provisional until `notify_ready`.
    pub fn apply(&self, bundle: &Bundle) -> Result<Bundle> {
        let record = self.store.get(&bundle.id)?;
        if record.status != BundleStatus::Verified {
            return Err(UpdateError::InvalidTransition {
                id: record.id,
                from: record.status,
                to: BundleStatus::Active,
            });
        }
        let previous = self.store.current().ok().map(|b| b.id);

        if let Err(e) = self.store.unpack(&record.id) {
            warn!(bundle_id = %record.id, error = %e, "Unpack failed");
            if let Err(discard_err) = self.store.discard(&record.id, &e.to_string()) {
                warn!(bundle_id = %record.id, error = %discard_err, "Could not discard bundle");
            }
            return Err(e);
        }

        let activated = self.store.activate(&record.id)?;
        self.readiness.begin(&activated.id, previous.clone())?;

        info!(bundle_id = %activated.id, version = %activated.version, previous = ?previous, "Bundle applied");
        Ok(activated)
    }

    /// Check, download, validate and apply in one call.
    /// Returns the newly active bundle, or `None` when already up to date.
    pub async fn sync(&self) -> Result<Option<Bundle>> {
        let current_version = self.current_version();
        let Some(candidate) = self.find_candidate(&current_version).await? else {
            return Ok(None);
        };
        self.install(&candidate).await.map(Some)
    }

    async fn install(&self, candidate: &Bundle) -> Result<Bundle> {
        let staged = self.download(candidate).await?;
        let verified = if staged.status == BundleStatus::Verified {
            staged
        } else {
            self.validate(&staged)?
        };
        self.apply(&verified)
    }

    // ========== Readiness ==========

    /// Host signal that the active bundle started. Returns the confirmed id.
    /// Old bundles are pruned only once the new one is confirmed.
    pub fn notify_ready(&self) -> Result<Option<String>> {
        let Some(state) = self.readiness.confirm()? else {
            return Ok(None);
        };
        match self.store.prune(self.config.keep_count) {
            Ok(removed) if !removed.is_empty() => debug!(removed = ?removed, "Pruned old bundles"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Prune after confirmation failed"),
        }
        let to_version = self
            .store
            .get(&state.bundle_id)
            .map(|b| b.version)
            .unwrap_or_default();
        self.record(UpdateOutcome {
            from_version: &self.version_of(state.previous_id.as_deref()),
            to_version: &to_version,
            success: true,
            duration_ms: elapsed_ms(&state),
            rollback_triggered: false,
            error: None,
        });
        Ok(Some(state.bundle_id))
    }

    /// Wait for `notify_ready`. On timeout the bundle is rolled back first and
    /// `ReadinessTimeout` names what was restored. A newer activation taking
    /// over the wait is reported as `Replaced`, not as a confirmation.
    pub async fn await_readiness(&self, timeout: Duration) -> Result<ReadyOutcome> {
        let Some(state) = self.readiness.provisional()? else {
            return Ok(ReadyOutcome::Cleared);
        };
        match self.readiness.wait_ready(&state.bundle_id, timeout).await {
            Some(ReadyOutcome::Replaced { by }) => {
                warn!(bundle_id = %state.bundle_id, replaced_by = %by, "Bundle replaced before confirming");
                return Ok(ReadyOutcome::Replaced { by });
            }
            Some(outcome) => return Ok(outcome),
            None => {}
        }

        let restored = self.roll_back_provisional(&state, "readiness timeout")?;
        Err(UpdateError::ReadinessTimeout {
            bundle_id: state.bundle_id,
            timeout,
            restored,
        })
    }

    /// Count an unconfirmed launch and roll back once the limit is exceeded
    pub fn recover_on_launch(&self) -> Result<LaunchOutcome> {
        let Some(state) = self.readiness.on_launch()? else {
            return Ok(LaunchOutcome::Stable);
        };
        if self.store.current().ok().map(|b| b.id).as_deref() != Some(state.bundle_id.as_str()) {
            // Pointer already moved on; the marker is stale
            self.readiness.clear()?;
            return Ok(LaunchOutcome::Stable);
        }

        if state.launch_attempts > self.config.max_launch_attempts {
            let restored = self.roll_back_provisional(&state, "too many unconfirmed launches")?;
            return Ok(LaunchOutcome::RolledBack {
                from: state.bundle_id,
                restored,
            });
        }
        Ok(LaunchOutcome::Provisional {
            bundle_id: state.bundle_id,
            launch_attempts: state.launch_attempts,
        })
    }

    fn roll_back_provisional(&self, state: &ProvisionalState, reason: &str) -> Result<Option<String>> {
        let active = self.store.current().ok().map(|b| b.id);
        if active.as_deref() != Some(state.bundle_id.as_str()) {
            self.readiness.clear()?;
            return Ok(active);
        }

        let from_version = self.version_of(Some(&state.bundle_id));
        let restored = match self.store.rollback() {
            Ok(bundle) => Some(bundle.id),
            Err(UpdateError::NoFallback) => None,
            Err(e) => return Err(e),
        };
        self.readiness.clear()?;

        warn!(bundle_id = %state.bundle_id, restored = ?restored, reason, "Rolled back provisional bundle");
        self.record(UpdateOutcome {
            from_version: &self.version_of(state.previous_id.as_deref()),
            to_version: &from_version,
            success: false,
            duration_ms: elapsed_ms(state),
            rollback_triggered: true,
            error: Some(reason.to_string()),
        });
        Ok(restored)
    }

    // ========== Maintenance ==========

    /// Remove every downloaded bundle; the embedded bundle serves the app
    pub fn reset(&self) -> Result<usize> {
        self.readiness.clear()?;
        let removed = self.store.reset()?;
        info!(removed, "Reverted to embedded bundle");
        Ok(removed)
    }

    fn version_of(&self, bundle_id: Option<&str>) -> String {
        bundle_id
            .and_then(|id| self.store.get(id).ok())
            .map(|b| b.version)
            .unwrap_or_else(|| self.config.embedded_version.clone())
    }

    fn record(&self, outcome: UpdateOutcome<'_>) {
        if let Err(e) = self.metrics.record_update(outcome) {
            warn!(error = %e, "Failed to record update metrics");
        }
    }
}

fn elapsed_ms(state: &ProvisionalState) -> u64 {
    (chrono::Utc::now() - state.activated_at)
        .num_milliseconds()
        .max(0) as u64
}

#[async_trait]
impl LiveUpdateCheck for LiveUpdateEngine {
    async fn check_live_update(&self, auto_apply: bool) -> Result<LiveUpdateInfo> {
        let current_version = self.current_version();
        let candidate = self.find_candidate(&current_version).await?;

        let mut info = LiveUpdateInfo {
            update_available: candidate.is_some(),
            current_version,
            latest_version: candidate.as_ref().map(|b| b.version.clone()),
            bundle_id: candidate.as_ref().map(|b| b.id.clone()),
            applied: false,
        };
        if let (true, Some(candidate)) = (auto_apply, candidate) {
            self.install(&candidate).await?;
            info.applied = true;
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ErrorKind;
    use crate::engine::keystore::{MemoryStorage, PUBLIC_KEY_ENTRY};
    use crate::engine::updater::bundle::BundleManifest;
    use crate::engine::updater::security::ChecksumAlgorithm;
    use ed25519_dalek::{Signer, SigningKey};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Serves whatever manifest it was last given
    #[derive(Default)]
    struct StaticSource {
        manifest: Mutex<Option<BundleManifest>>,
    }

    impl StaticSource {
        fn publish(&self, manifest: BundleManifest) {
            *self.manifest.lock().unwrap() = Some(manifest);
        }
    }

    #[async_trait]
    impl MetadataSource for StaticSource {
        async fn latest(&self, _current: &str, _channel: &str) -> Result<Option<BundleManifest>> {
            Ok(self.manifest.lock().unwrap().clone())
        }
    }

    struct Harness {
        _dir: TempDir,
        server: MockServer,
        source: Arc<StaticSource>,
        engine: LiveUpdateEngine,
    }

    async fn harness(tweak: impl FnOnce(&mut LiveUpdateConfig)) -> Harness {
        harness_with_keys(tweak, None).await
    }

    async fn harness_with_keys(
        tweak: impl FnOnce(&mut LiveUpdateConfig),
        keys: Option<&dyn SecureStorage>,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        let mut config = LiveUpdateConfig::new(&server.uri(), "1.0.0");
        config.storage_dir = Some(dir.path().to_path_buf());
        config.security.enforce_https = false;
        config.download.initial_backoff_ms = 1;
        config.download.jitter = false;
        tweak(&mut config);

        let source = Arc::new(StaticSource::default());
        let engine = LiveUpdateEngine::with_source(config, keys, source.clone()).unwrap();
        Harness {
            _dir: dir,
            server,
            source,
            engine,
        }
    }

    impl Harness {
        /// Serve `payload` and publish a manifest describing it
        async fn publish(&self, version: &str, payload: &[u8]) -> BundleManifest {
            let route = format!("/bundles/{}.bin", version);
            Mock::given(method("GET"))
                .and(path(route.as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.to_vec()))
                .mount(&self.server)
                .await;
            let manifest = BundleManifest {
                id: None,
                version: version.to_string(),
                url: format!("{}{}", self.server.uri(), route),
                checksum: SecurityValidator::compute_checksum(payload, ChecksumAlgorithm::Sha256),
                signature: None,
                channel: "production".to_string(),
                size: Some(payload.len() as u64),
                min_binary_version: None,
            };
            self.source.publish(manifest.clone());
            manifest
        }

        /// Publish a release whose advertised checksum does not match
        async fn publish_corrupt(&self, version: &str, payload: &[u8]) {
            let mut manifest = self.publish(version, payload).await;
            manifest.checksum = "0".repeat(64);
            self.source.publish(manifest);
        }
    }

    #[tokio::test]
    async fn test_no_manifest_means_up_to_date() {
        let h = harness(|_| {}).await;
        let result = h.engine.check_for_update().await;
        assert!(!result.available);
        assert_eq!(result.current_version, "1.0.0");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_same_version_is_not_an_update() {
        let h = harness(|_| {}).await;
        h.publish("1.0.0", b"same").await;
        assert!(!h.engine.check_for_update().await.available);
    }

    #[tokio::test]
    async fn test_cross_channel_candidate_is_invisible() {
        let h = harness(|_| {}).await;
        let mut manifest = h.publish("1.0.1", b"beta").await;
        manifest.channel = "staging".to_string();
        h.source.publish(manifest);
        assert!(!h.engine.check_for_update().await.available);
    }

    #[tokio::test]
    async fn test_downgrade_policy() {
        let h = harness(|_| {}).await;
        h.publish("0.9.0", b"old").await;
        assert!(!h.engine.check_for_update().await.available);

        let h = harness(|c| c.allow_downgrade = true).await;
        h.publish("0.9.0", b"old").await;
        assert!(h.engine.check_for_update().await.available);
    }

    #[tokio::test]
    async fn test_min_binary_version_filters_candidate() {
        let h = harness(|c| c.binary_version = "2.0.0".to_string()).await;
        let mut manifest = h.publish("1.0.1", b"needs newer").await;
        manifest.min_binary_version = Some("3.0.0".to_string());
        h.source.publish(manifest);
        assert!(!h.engine.check_for_update().await.available);
    }

    #[tokio::test]
    async fn test_malformed_version_reported_not_equal() {
        let h = harness(|_| {}).await;
        let mut manifest = h.publish("1.0.1", b"x").await;
        manifest.version = "latest".to_string();
        h.source.publish(manifest);

        let result = h.engine.check_for_update().await;
        assert!(!result.available);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::Integrity));
    }

    #[tokio::test]
    async fn test_sync_installs_provisionally() {
        let h = harness(|_| {}).await;
        h.publish("1.0.1", b"console.log('1.0.1')").await;

        let active = h.engine.sync().await.unwrap().unwrap();
        assert_eq!(active.version, "1.0.1");
        assert_eq!(h.engine.current_version(), "1.0.1");
        assert!(h.engine.load_path().is_some());

        assert_eq!(h.engine.notify_ready().unwrap(), Some(active.id));
        assert!(h.engine.sync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_signature_required_but_missing() {
        let h = harness(|c| c.security.require_signature = true).await;
        h.publish("1.0.1", b"unsigned").await;

        let result = h.engine.sync().await;
        assert!(matches!(
            result,
            Err(UpdateError::Integrity(IntegrityFailure::MissingSignature))
        ));
        assert_eq!(h.engine.current_version(), "1.0.0");
        let records = h.engine.store().list().unwrap();
        assert_eq!(records[0].status, BundleStatus::Failed);
        assert!(records[0].location.is_none());
    }

    #[tokio::test]
    async fn test_signature_from_keystore() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let keys = MemoryStorage::new();
        keys.set(PUBLIC_KEY_ENTRY, &hex::encode(signing.verifying_key().to_bytes()))
            .unwrap();

        let storage: &dyn SecureStorage = &keys;
        let h = harness_with_keys(|c| c.security.require_signature = true, Some(storage)).await;
        let payload = b"signed bundle";
        let mut manifest = h.publish("1.0.1", payload).await;
        let digest = ChecksumAlgorithm::Sha256.digest(payload);
        manifest.signature = Some(hex::encode(signing.sign(&digest).to_bytes()));
        h.source.publish(manifest.clone());

        let active = h.engine.sync().await.unwrap().unwrap();
        assert_eq!(active.version, "1.0.1");

        // A signature from another key is rejected
        let forged = SigningKey::from_bytes(&[9u8; 32]);
        let payload = b"forged bundle";
        let mut manifest = h.publish("1.0.2", payload).await;
        let digest = ChecksumAlgorithm::Sha256.digest(payload);
        manifest.signature = Some(hex::encode(forged.sign(&digest).to_bytes()));
        h.source.publish(manifest);

        assert!(matches!(
            h.engine.sync().await,
            Err(UpdateError::Integrity(IntegrityFailure::InvalidSignature))
        ));
        assert_eq!(h.engine.current_version(), "1.0.1");
    }

    #[tokio::test]
    async fn test_size_mismatch_discards() {
        let h = harness(|_| {}).await;
        let mut manifest = h.publish("1.0.1", b"twelve bytes").await;
        manifest.size = Some(4);
        h.source.publish(manifest);

        assert!(matches!(
            h.engine.sync().await,
            Err(UpdateError::Integrity(IntegrityFailure::SizeMismatch { .. }))
        ));
        assert!(h.engine.store().current().is_err());
    }

    #[tokio::test]
    async fn test_recover_on_launch_rolls_back_after_limit() {
        let h = harness(|c| c.max_launch_attempts = 2).await;
        h.publish("1.0.1", b"crashy").await;
        let active = h.engine.sync().await.unwrap().unwrap();

        for attempt in 1..=2 {
            assert_eq!(
                h.engine.recover_on_launch().unwrap(),
                LaunchOutcome::Provisional {
                    bundle_id: active.id.clone(),
                    launch_attempts: attempt,
                }
            );
        }
        assert_eq!(
            h.engine.recover_on_launch().unwrap(),
            LaunchOutcome::RolledBack {
                from: active.id.clone(),
                restored: None,
            }
        );
        assert_eq!(h.engine.current_version(), "1.0.0");
        assert_eq!(
            h.engine.store().get(&active.id).unwrap().status,
            BundleStatus::RolledBack
        );
        assert_eq!(h.engine.recover_on_launch().unwrap(), LaunchOutcome::Stable);
    }

    #[tokio::test]
    async fn test_confirmed_bundle_survives_launches() {
        let h = harness(|c| c.max_launch_attempts = 1).await;
        h.publish("1.0.1", b"stable").await;
        h.engine.sync().await.unwrap();
        h.engine.notify_ready().unwrap();

        for _ in 0..3 {
            assert_eq!(h.engine.recover_on_launch().unwrap(), LaunchOutcome::Stable);
        }
        assert_eq!(h.engine.current_version(), "1.0.1");
    }

    #[tokio::test]
    async fn test_failed_downloads_keep_rollback_target() {
        for keep_count in [0, 2] {
            let h = harness(|c| c.keep_count = keep_count).await;
            h.publish("1.0.1", b"good").await;
            let good = h.engine.sync().await.unwrap().unwrap();
            h.engine.notify_ready().unwrap();

            for version in ["1.0.2", "1.0.3"] {
                h.publish_corrupt(version, b"tampered").await;
                assert!(h.engine.sync().await.is_err());
            }
            h.publish("1.0.4", b"never starts").await;
            let bad = h.engine.sync().await.unwrap().unwrap();
            assert!(h.engine.store().get(&good.id).is_ok());

            match h.engine.await_readiness(Duration::from_millis(20)).await {
                Err(UpdateError::ReadinessTimeout {
                    bundle_id,
                    restored,
                    ..
                }) => {
                    assert_eq!(bundle_id, bad.id);
                    assert_eq!(restored, Some(good.id.clone()));
                }
                other => panic!("expected readiness timeout, got {:?}", other),
            }
            assert_eq!(h.engine.current_version(), "1.0.1");
        }
    }

    #[tokio::test]
    async fn test_rolled_back_bundle_not_offered_again() {
        let h = harness(|_| {}).await;
        h.publish("1.0.1", b"never starts").await;
        h.engine.sync().await.unwrap().unwrap();
        assert!(h.engine.await_readiness(Duration::from_millis(20)).await.is_err());
        assert_eq!(h.engine.current_version(), "1.0.0");

        assert!(!h.engine.check_for_update().await.available);
        assert!(h.engine.sync().await.unwrap().is_none());
        let info = h.engine.check_live_update(true).await.unwrap();
        assert!(!info.update_available);
        assert!(!info.applied);
        assert_eq!(h.engine.current_version(), "1.0.0");

        // A later release is still offered
        h.publish("1.0.2", b"fixed").await;
        assert!(h.engine.check_for_update().await.available);
    }

    #[tokio::test]
    async fn test_prune_waits_for_confirmation() {
        let h = harness(|c| c.keep_count = 0).await;
        for version in ["1.0.1", "1.0.2", "1.0.3"] {
            h.publish(version, version.as_bytes()).await;
            h.engine.sync().await.unwrap().unwrap();
        }
        // Nothing confirmed yet, so nothing pruned
        assert_eq!(h.engine.store().list().unwrap().len(), 3);

        h.engine.notify_ready().unwrap();
        let versions: Vec<String> = h
            .engine
            .store()
            .list()
            .unwrap()
            .into_iter()
            .map(|b| b.version)
            .collect();
        assert_eq!(versions, vec!["1.0.3", "1.0.2"]);
    }

    #[tokio::test]
    async fn test_newer_activation_replaces_wait() {
        let h = harness(|_| {}).await;
        h.publish("1.0.1", b"first").await;
        h.engine.sync().await.unwrap().unwrap();
        h.publish("1.0.2", b"second").await;

        let (outcome, synced) = tokio::join!(
            h.engine.await_readiness(Duration::from_secs(5)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                h.engine.sync().await
            }
        );
        let second = synced.unwrap().unwrap();
        assert_eq!(
            outcome.unwrap(),
            ReadyOutcome::Replaced {
                by: second.id.clone()
            }
        );
        assert_eq!(h.engine.current_version(), "1.0.2");
    }

    #[tokio::test]
    async fn test_download_failure_closes_record() {
        let h = harness(|c| c.download.max_attempts = 1).await;
        let mut manifest = h.publish("1.0.1", b"gone").await;
        manifest.url = format!("{}/missing.bin", h.server.uri());
        h.source.publish(manifest);

        assert!(matches!(h.engine.sync().await, Err(UpdateError::Network(_))));
        let records = h.engine.store().list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BundleStatus::Failed);
        assert!(records[0].failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let h = harness(|_| {}).await;
        h.publish("1.0.1", b"good").await;
        h.engine.sync().await.unwrap();
        h.engine.notify_ready().unwrap();
        h.publish_corrupt("1.0.2", b"tampered").await;
        assert!(h.engine.sync().await.is_err());

        let metrics = h.engine.metrics().unwrap();
        assert_eq!(metrics.updates.total_updates, 2);
        assert_eq!(metrics.updates.successful_updates, 1);
        assert_eq!(metrics.updates.failed_updates, 1);
        assert_eq!(metrics.updates.success_rate(), 50.0);
        assert_eq!(
            metrics.updates.last_update_version.as_deref(),
            Some("1.0.2")
        );
    }

    #[tokio::test]
    async fn test_reset_reverts_to_embedded() {
        let h = harness(|_| {}).await;
        h.publish("1.0.1", b"one").await;
        h.engine.sync().await.unwrap();

        assert_eq!(h.engine.reset().unwrap(), 1);
        assert_eq!(h.engine.current_version(), "1.0.0");
        assert!(h.engine.load_path().is_none());
        assert!(h.engine.notify_ready().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_check_auto_apply() {
        let h = harness(|_| {}).await;
        h.publish("1.0.1", b"auto").await;

        let info = h.engine.check_live_update(false).await.unwrap();
        assert!(info.update_available);
        assert!(!info.applied);
        assert_eq!(h.engine.current_version(), "1.0.0");

        let info = h.engine.check_live_update(true).await.unwrap();
        assert!(info.applied);
        assert_eq!(h.engine.current_version(), "1.0.1");
    }
}
