//! Background Update Scheduler
//!
//! Runs the live-update and store-update checks side by side, merges their
//! outcomes and decides whether to notify.
//!
//! Components:
//! - `status` - Run statistics and result types
//! - `collaborators` - Injected platform capabilities

pub mod collaborators;
pub mod status;

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::config::SchedulerConfig;
use crate::engine::error::{ErrorInfo, Result, UpdateError};

pub use collaborators::{
    CheckConditions, DefaultConditions, HttpStoreChecker, LiveUpdateCheck, LogNotifier,
    NotificationManager, StoreUpdateChecker,
};
pub use status::{
    AppUpdateInfo, LiveUpdateInfo, NotificationPayload, SchedulerCheckResult, SchedulerStatus,
};

/// Marks a check in flight; clears `is_running` on drop
struct RunningGuard<'a> {
    status: &'a Mutex<SchedulerStatus>,
}

impl<'a> RunningGuard<'a> {
    fn acquire(status: &'a Mutex<SchedulerStatus>) -> Result<Self> {
        let mut current = lock(status)?;
        if current.is_running {
            return Err(UpdateError::AlreadyRunning);
        }
        current.is_running = true;
        current.check_count += 1;
        Ok(Self { status })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        status.is_running = false;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| UpdateError::Storage("scheduler state lock poisoned".to_string()))
}

pub struct BackgroundScheduler {
    config: Mutex<SchedulerConfig>,
    status: Mutex<SchedulerStatus>,
    live: Arc<dyn LiveUpdateCheck>,
    store: Arc<dyn StoreUpdateChecker>,
    notifier: Arc<dyn NotificationManager>,
    conditions: Arc<dyn CheckConditions>,
}

impl BackgroundScheduler {
    pub fn new(
        config: SchedulerConfig,
        live: Arc<dyn LiveUpdateCheck>,
        store: Arc<dyn StoreUpdateChecker>,
        notifier: Arc<dyn NotificationManager>,
    ) -> Self {
        let status = SchedulerStatus {
            enabled: config.enabled,
            ..SchedulerStatus::default()
        };
        Self {
            config: Mutex::new(config),
            status: Mutex::new(status),
            live,
            store,
            notifier,
            conditions: Arc::new(DefaultConditions),
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn CheckConditions>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Replace the configuration and reset run statistics
    pub fn configure(&self, config: SchedulerConfig) -> Result<()> {
        if config.interval_secs == 0 {
            return Err(UpdateError::InvalidConfig(
                "scheduler interval must be greater than zero".to_string(),
            ));
        }
        let mut status = lock(&self.status)?;
        if status.is_running {
            return Err(UpdateError::AlreadyRunning);
        }
        *status = SchedulerStatus {
            enabled: config.enabled,
            ..SchedulerStatus::default()
        };
        info!(
            enabled = config.enabled,
            interval_secs = config.interval_secs,
            update_types = ?config.update_types,
            "Scheduler configured"
        );
        *lock(&self.config)? = config;
        Ok(())
    }

    pub fn config(&self) -> Result<SchedulerConfig> {
        Ok(lock(&self.config)?.clone())
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        Ok(lock(&self.status)?.clone())
    }

    /// Advisory: now + interval
    pub fn calculate_next_check_time(&self) -> Result<DateTime<Utc>> {
        let interval = self.config()?.interval();
        let interval = chrono::Duration::from_std(interval)
            .map_err(|e| UpdateError::InvalidConfig(format!("scheduler interval: {}", e)))?;
        Ok(Utc::now() + interval)
    }

    /// Gating hooks a scheduled run must pass
    pub fn conditions_met(&self) -> bool {
        let Ok(config) = self.config() else {
            return false;
        };
        if !self
            .conditions
            .is_network_condition_met(config.require_unmetered_network)
        {
            return false;
        }
        if config.respect_battery_optimization
            && self.conditions.should_respect_battery_optimization()
        {
            return self.conditions.is_battery_level_sufficient();
        }
        true
    }

    /// Run one check cycle. Rejects with `AlreadyRunning` if one is in flight.
    pub async fn perform_check(&self) -> Result<SchedulerCheckResult> {
        let config = self.config()?;
        if !config.enabled {
            return Err(UpdateError::InvalidConfig(
                "background checks are disabled".to_string(),
            ));
        }

        let guard = RunningGuard::acquire(&self.status)?;
        let span = info_span!("update_check", run_id = %Uuid::new_v4());
        let outcome = self.run_cycle(&config).instrument(span).await;

        let result = {
            let mut status = lock(&self.status)?;
            status.last_check_time = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    status.last_error = None;
                    result
                }
                Err(e) => {
                    warn!(error = %e, "Update check failed");
                    let info = ErrorInfo::from(&e);
                    status.failure_count += 1;
                    status.last_error = Some(info.clone());
                    SchedulerCheckResult::failed(info)
                }
            }
        };
        drop(guard);
        Ok(result)
    }

    async fn run_cycle(&self, config: &SchedulerConfig) -> Result<SchedulerCheckResult> {
        let live_task = config.update_types.includes_live().then(|| {
            let live = self.live.clone();
            let auto_apply = config.auto_apply;
            tokio::spawn(async move { live.check_live_update(auto_apply).await }.in_current_span())
        });
        let store_task = config.update_types.includes_store().then(|| {
            let store = self.store.clone();
            tokio::spawn(async move { store.check_store_update().await }.in_current_span())
        });

        let (live_outcome, store_outcome) =
            tokio::join!(join_branch("live", live_task), join_branch("store", store_task));

        let mut result = SchedulerCheckResult::empty();
        match live_outcome {
            Some(Ok(info)) => result.live_update = Some(info),
            Some(Err(e)) => {
                warn!(error = %e, "Live update check failed");
                result.live_error = Some(ErrorInfo::from(&e));
            }
            None => {}
        }
        match store_outcome {
            Some(Ok(info)) => result.app_update = Some(info),
            Some(Err(e)) => {
                warn!(error = %e, "Store update check failed");
                result.store_error = Some(ErrorInfo::from(&e));
            }
            None => {}
        }

        let payload = NotificationPayload {
            app_update: result.app_update.clone().filter(|a| a.update_available),
            live_update: result.live_update.clone().filter(|l| l.update_available),
        };
        result.updates_found = !payload.is_empty();
        if result.updates_found {
            result.notification_sent = self.notifier.notify(&payload).await?;
        }

        info!(
            updates_found = result.updates_found,
            notification_sent = result.notification_sent,
            "Update check complete"
        );
        Ok(result)
    }

    /// Check on the configured interval until `shutdown` flips to true or
    /// its sender is dropped
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let config = match self.config() {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Scheduler loop stopping");
                    break;
                }
            };

            if !config.enabled {
                debug!("Background checks disabled, skipping");
            } else if !self.conditions_met() {
                debug!("Check conditions not met, skipping");
            } else {
                match self.perform_check().await {
                    Ok(result) if !result.success => {
                        warn!(error = ?result.error, "Scheduled check failed")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Scheduled check skipped"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Scheduler loop stopped");
    }
}

async fn join_branch<T>(name: &str, task: Option<JoinHandle<Result<T>>>) -> Option<Result<T>> {
    let handle = task?;
    Some(match handle.await {
        Ok(outcome) => outcome,
        Err(e) => Err(UpdateError::Storage(format!("{} check aborted: {}", name, e))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::UpdateTypes;
    use crate::engine::error::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct StaticLive {
        available: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl LiveUpdateCheck for StaticLive {
        async fn check_live_update(&self, _auto_apply: bool) -> Result<LiveUpdateInfo> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(LiveUpdateInfo {
                update_available: self.available,
                current_version: "1.0.0".to_string(),
                latest_version: self.available.then(|| "1.0.1".to_string()),
                bundle_id: None,
                applied: false,
            })
        }
    }

    struct FailingLive;

    #[async_trait]
    impl LiveUpdateCheck for FailingLive {
        async fn check_live_update(&self, _auto_apply: bool) -> Result<LiveUpdateInfo> {
            Err(UpdateError::Network("connection refused".to_string()))
        }
    }

    struct StaticStore(Option<bool>);

    #[async_trait]
    impl StoreUpdateChecker for StaticStore {
        async fn check_store_update(&self) -> Result<AppUpdateInfo> {
            match self.0 {
                Some(available) => Ok(AppUpdateInfo {
                    update_available: available,
                    platform: "test".to_string(),
                    latest_version: None,
                }),
                None => Err(UpdateError::Network("store unreachable".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: AtomicUsize,
        last: Mutex<Option<NotificationPayload>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationManager for RecordingNotifier {
        async fn notify(&self, payload: &NotificationPayload) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(payload.clone());
            if self.fail {
                return Err(UpdateError::InvalidConfig("notification channel missing".to_string()));
            }
            Ok(true)
        }
    }

    struct LowBattery;

    impl CheckConditions for LowBattery {
        fn is_battery_level_sufficient(&self) -> bool {
            false
        }
    }

    fn scheduler(
        live: Arc<dyn LiveUpdateCheck>,
        store: Option<bool>,
        notifier: Arc<RecordingNotifier>,
    ) -> BackgroundScheduler {
        BackgroundScheduler::new(
            SchedulerConfig::default(),
            live,
            Arc::new(StaticStore(store)),
            notifier,
        )
    }

    fn live(available: bool) -> Arc<dyn LiveUpdateCheck> {
        Arc::new(StaticLive {
            available,
            gate: None,
        })
    }

    #[tokio::test]
    async fn test_disabled_check_has_no_side_effects() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(live(true), Some(true), notifier.clone());
        scheduler
            .configure(SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            })
            .unwrap();

        let result = scheduler.perform_check().await;
        assert!(matches!(result, Err(UpdateError::InvalidConfig(_))));
        let status = scheduler.status().unwrap();
        assert_eq!(status.check_count, 0);
        assert!(status.last_check_time.is_none());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_hide_live_update() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(live(true), None, notifier.clone());

        let result = scheduler.perform_check().await.unwrap();
        assert!(result.success);
        assert!(result.updates_found);
        assert!(result.live_update.is_some());
        assert!(result.app_update.is_none());
        assert_eq!(result.store_error.as_ref().map(|e| e.kind), Some(ErrorKind::Network));
        assert!(result.notification_sent);

        let payload = notifier.last.lock().unwrap().clone().unwrap();
        assert!(payload.app_update.is_none());
        assert!(payload.live_update.is_some());
    }

    #[tokio::test]
    async fn test_live_failure_does_not_hide_store_update() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(Arc::new(FailingLive), Some(true), notifier);

        let result = scheduler.perform_check().await.unwrap();
        assert!(result.success);
        assert!(result.updates_found);
        assert!(result.app_update.is_some());
        // Transport details never reach the result
        assert_eq!(
            result.live_error.unwrap().message,
            ErrorKind::Network.description()
        );
    }

    #[tokio::test]
    async fn test_nothing_found_skips_notification() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(live(false), Some(false), notifier.clone());

        let result = scheduler.perform_check().await.unwrap();
        assert!(result.success);
        assert!(!result.updates_found);
        assert!(!result.notification_sent);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        let status = scheduler.status().unwrap();
        assert_eq!(status.check_count, 1);
        assert!(!status.is_running);
        assert!(status.last_check_time.is_some());
    }

    #[tokio::test]
    async fn test_update_types_limit_branches() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(live(true), Some(true), notifier);
        scheduler
            .configure(SchedulerConfig {
                update_types: UpdateTypes::Store,
                ..SchedulerConfig::default()
            })
            .unwrap();

        let result = scheduler.perform_check().await.unwrap();
        assert!(result.live_update.is_none());
        assert!(result.live_error.is_none());
        assert!(result.app_update.is_some());
    }

    #[tokio::test]
    async fn test_notification_failure_is_coordination_failure() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        });
        let scheduler = scheduler(live(true), Some(false), notifier);

        let result = scheduler.perform_check().await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());

        let status = scheduler.status().unwrap();
        assert_eq!(status.failure_count, 1);
        assert!(status.last_error.is_some());
        assert!(!status.is_running);

        // Reconfiguring resets statistics
        scheduler.configure(SchedulerConfig::default()).unwrap();
        let status = scheduler.status().unwrap();
        assert_eq!(status.failure_count, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_overlapping_check_rejected() {
        let gate = Arc::new(Notify::new());
        let live = Arc::new(StaticLive {
            available: false,
            gate: Some(gate.clone()),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Arc::new(scheduler(live, Some(false), notifier));

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.perform_check().await })
        };
        while !scheduler.status().unwrap().is_running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(
            scheduler.perform_check().await,
            Err(UpdateError::AlreadyRunning)
        ));
        assert!(matches!(
            scheduler.configure(SchedulerConfig::default()),
            Err(UpdateError::AlreadyRunning)
        ));

        gate.notify_one();
        assert!(first.await.unwrap().unwrap().success);
        let status = scheduler.status().unwrap();
        assert_eq!(status.check_count, 1);
        assert!(!status.is_running);
    }

    #[test]
    fn test_next_check_time_uses_interval() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = scheduler(live(false), Some(false), notifier);
        let next = scheduler.calculate_next_check_time().unwrap();
        let delta = next - Utc::now();
        assert!(delta > chrono::Duration::hours(23));
        assert!(delta <= chrono::Duration::hours(24));
    }

    #[test]
    fn test_battery_gate() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler =
            scheduler(live(false), Some(false), notifier).with_conditions(Arc::new(LowBattery));
        assert!(!scheduler.conditions_met());

        scheduler
            .configure(SchedulerConfig {
                respect_battery_optimization: false,
                ..SchedulerConfig::default()
            })
            .unwrap();
        assert!(scheduler.conditions_met());
    }

    #[tokio::test]
    async fn test_run_loop_checks_then_stops() {
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Arc::new(scheduler(live(false), Some(false), notifier));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_loop(rx).await })
        };
        while scheduler.status().unwrap().check_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        runner.await.unwrap();
        assert_eq!(scheduler.status().unwrap().check_count, 1);
    }
}
