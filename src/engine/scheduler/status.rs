//! Scheduler State and Results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::ErrorInfo;

/// Run statistics. Reset only by `configure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub is_running: bool,
    pub check_count: u64,
    pub failure_count: u64,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorInfo>,
}

/// Store (binary) update branch outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUpdateInfo {
    pub update_available: bool,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

/// Live (bundle) update branch outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveUpdateInfo {
    pub update_available: bool,
    pub current_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    /// Downloaded, verified and activated during this check
    #[serde(default)]
    pub applied: bool,
}

/// What the notifier is asked to surface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub app_update: Option<AppUpdateInfo>,
    pub live_update: Option<LiveUpdateInfo>,
}

impl NotificationPayload {
    pub fn is_empty(&self) -> bool {
        self.app_update.is_none() && self.live_update.is_none()
    }
}

/// Merged outcome of one check cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerCheckResult {
    /// False only when the coordination itself failed
    pub success: bool,
    pub updates_found: bool,
    pub app_update: Option<AppUpdateInfo>,
    pub live_update: Option<LiveUpdateInfo>,
    pub notification_sent: bool,
    pub error: Option<ErrorInfo>,
    pub live_error: Option<ErrorInfo>,
    pub store_error: Option<ErrorInfo>,
    pub checked_at: DateTime<Utc>,
}

impl SchedulerCheckResult {
    pub(crate) fn empty() -> Self {
        Self {
            success: true,
            updates_found: false,
            app_update: None,
            live_update: None,
            notification_sent: false,
            error: None,
            live_error: None,
            store_error: None,
            checked_at: Utc::now(),
        }
    }

    pub(crate) fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::empty()
        }
    }
}
