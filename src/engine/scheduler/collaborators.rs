//! Scheduler Collaborators
//!
//! Platform capabilities the scheduler is given at construction, plus
//! default implementations.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::status::{AppUpdateInfo, LiveUpdateInfo, NotificationPayload};
use crate::engine::error::{Result, UpdateError};
use crate::engine::updater::version::VersionManager;

/// The engine's check-and-maybe-update path
#[async_trait]
pub trait LiveUpdateCheck: Send + Sync {
    async fn check_live_update(&self, auto_apply: bool) -> Result<LiveUpdateInfo>;
}

/// "Is a newer store binary available"
#[async_trait]
pub trait StoreUpdateChecker: Send + Sync {
    async fn check_store_update(&self) -> Result<AppUpdateInfo>;
}

/// Surfaces a user-visible prompt. Returns whether one was shown.
#[async_trait]
pub trait NotificationManager: Send + Sync {
    async fn notify(&self, payload: &NotificationPayload) -> Result<bool>;
}

/// Gating predicates consulted before a scheduled run
pub trait CheckConditions: Send + Sync {
    fn is_network_condition_met(&self, _require_unmetered: bool) -> bool {
        true
    }

    fn is_battery_level_sufficient(&self) -> bool {
        true
    }

    fn should_respect_battery_optimization(&self) -> bool {
        true
    }
}

/// Always permits a run
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConditions;

impl CheckConditions for DefaultConditions {}

/// Logs the payload; never shows anything
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationManager for LogNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> Result<bool> {
        info!(
            app_update = ?payload.app_update.as_ref().and_then(|a| a.latest_version.as_deref()),
            live_update = ?payload.live_update.as_ref().and_then(|l| l.latest_version.as_deref()),
            "Update available"
        );
        Ok(false)
    }
}

#[derive(Debug, Deserialize)]
struct StoreRelease {
    version: String,
}

/// Queries a JSON `{ "version": ".." }` endpoint for the latest store binary
pub struct HttpStoreChecker {
    client: reqwest::Client,
    url: String,
    binary_version: String,
    platform: String,
}

impl HttpStoreChecker {
    pub fn new(url: &str, binary_version: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("LiveUpdate-Engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            binary_version: binary_version.to_string(),
            platform: std::env::consts::OS.to_string(),
        })
    }
}

#[async_trait]
impl StoreUpdateChecker for HttpStoreChecker {
    async fn check_store_update(&self) -> Result<AppUpdateInfo> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Network(format!(
                "store endpoint returned {}",
                response.status()
            )));
        }
        let release: StoreRelease = response
            .json()
            .await
            .map_err(|e| UpdateError::Parse(format!("store release: {}", e)))?;

        Ok(AppUpdateInfo {
            update_available: VersionManager::should_update(&self.binary_version, &release.version)?,
            platform: self.platform.clone(),
            latest_version: Some(release.version),
        })
    }
}
