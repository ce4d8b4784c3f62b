//! LiveUpdate - Over-the-air bundle updates
//!
//! Fetches, verifies, stages and activates code bundles without a store
//! release, rolling back automatically when a new bundle never reports ready.
//! A background scheduler drives the live check alongside a store-update check.

pub mod engine;

pub use engine::config::LiveUpdateConfig;
pub use engine::error::{ErrorInfo, ErrorKind, Result, UpdateError};
pub use engine::keystore::{KeyringStorage, MemoryStorage, SecureStorage};
pub use engine::scheduler::{
    BackgroundScheduler, CheckConditions, NotificationManager, SchedulerCheckResult,
    SchedulerStatus, StoreUpdateChecker,
};
pub use engine::updater::{
    Bundle, BundleStatus, BundleStore, LaunchOutcome, LiveUpdateEngine, ReadyOutcome,
    UpdateCheckResult, VersionManager,
};
