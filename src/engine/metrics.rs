//! Update Metrics
//!
//! Tracks update success rate and rollback counts across launches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::engine::error::{Result, UpdateError};
use crate::engine::updater::store::write_atomically;

/// Current metrics format version
pub const METRICS_VERSION: u32 = 1;

const METRICS_FILE: &str = "metrics.json";
const HISTORY_LIMIT: usize = 50;

/// Metrics data store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub version: u32,
    pub updates: UpdateMetrics,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            version: METRICS_VERSION,
            updates: UpdateMetrics::default(),
        }
    }
}

/// Update-related metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMetrics {
    pub total_updates: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    pub rollback_count: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_update_version: Option<String>,
    pub average_update_duration_ms: Option<u64>,
    pub update_history: Vec<UpdateRecord>,
}

/// Single update record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub timestamp: DateTime<Utc>,
    pub from_version: String,
    pub to_version: String,
    pub success: bool,
    pub duration_ms: u64,
    pub rollback_triggered: bool,
    pub error: Option<String>,
}

/// Outcome of one update attempt
#[derive(Debug, Clone)]
pub struct UpdateOutcome<'a> {
    pub from_version: &'a str,
    pub to_version: &'a str,
    pub success: bool,
    pub duration_ms: u64,
    pub rollback_triggered: bool,
    pub error: Option<String>,
}

impl UpdateMetrics {
    /// Record an update attempt
    pub fn record_update(&mut self, outcome: UpdateOutcome<'_>) {
        self.total_updates += 1;

        if outcome.success {
            self.successful_updates += 1;
        } else {
            self.failed_updates += 1;
        }

        if outcome.rollback_triggered {
            self.rollback_count += 1;
        }

        self.last_update = Some(Utc::now());
        self.last_update_version = Some(outcome.to_version.to_string());

        // Rolling average
        let total = self.total_updates;
        self.average_update_duration_ms = Some(match self.average_update_duration_ms {
            Some(avg) => ((avg * (total - 1)) + outcome.duration_ms) / total,
            None => outcome.duration_ms,
        });

        self.update_history.push(UpdateRecord {
            timestamp: Utc::now(),
            from_version: outcome.from_version.to_string(),
            to_version: outcome.to_version.to_string(),
            success: outcome.success,
            duration_ms: outcome.duration_ms,
            rollback_triggered: outcome.rollback_triggered,
            error: outcome.error,
        });

        if self.update_history.len() > HISTORY_LIMIT {
            let excess = self.update_history.len() - HISTORY_LIMIT;
            self.update_history.drain(..excess);
        }
    }

    /// Update success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_updates == 0 {
            return 100.0;
        }
        (self.successful_updates as f64 / self.total_updates as f64) * 100.0
    }
}

/// Load-modify-save recorder for `metrics.json`
pub struct MetricsCollector {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetricsCollector {
    pub fn new(store_root: &Path) -> Self {
        Self {
            path: store_root.join(METRICS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<Metrics> {
        if !self.path.exists() {
            return Ok(Metrics::default());
        }
        let content = fs::read_to_string(&self.path)?;
        let metrics: Metrics = serde_json::from_str(&content)?;
        if metrics.version > METRICS_VERSION {
            return Err(UpdateError::Storage("metrics version too new".to_string()));
        }
        Ok(metrics)
    }

    /// Record an update with automatic save
    pub fn record_update(&self, outcome: UpdateOutcome<'_>) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| UpdateError::Storage("metrics lock poisoned".to_string()))?;
        let mut metrics = self.load()?;
        metrics.updates.record_update(outcome);
        let content = serde_json::to_vec_pretty(&metrics)?;
        write_atomically(&self.path.with_extension("tmp"), &self.path, &content)
    }
}
