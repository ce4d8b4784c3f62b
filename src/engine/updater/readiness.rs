//! Readiness Tracking
//!
//! A freshly activated bundle is provisional until the host reports that it
//! started. The marker survives restarts so unconfirmed launches can be
//! counted and the bundle rolled back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::store::write_atomically;
use crate::engine::error::Result;

const MARKER_FILE: &str = "provisional.json";

/// Persisted provisional activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionalState {
    pub bundle_id: String,
    /// Bundle that was active before, `None` for the embedded bundle
    pub previous_id: Option<String>,
    pub activated_at: DateTime<Utc>,
    /// Launches that started on this bundle without confirming
    pub launch_attempts: u32,
}

/// How a wait on a provisional bundle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// The host signalled ready
    Confirmed,
    /// Another activation took over before the bundle was confirmed
    Replaced { by: String },
    /// The marker was dropped unconfirmed, or nothing was provisional
    Cleared,
}

#[derive(Debug, Clone, Default)]
struct Signal {
    /// Bundle awaiting confirmation
    pending: Option<String>,
    /// Last bundle the host confirmed
    confirmed: Option<String>,
}

impl Signal {
    fn outcome_for(&self, bundle_id: &str) -> ReadyOutcome {
        if self.confirmed.as_deref() == Some(bundle_id) {
            return ReadyOutcome::Confirmed;
        }
        match &self.pending {
            Some(other) => ReadyOutcome::Replaced { by: other.clone() },
            None => ReadyOutcome::Cleared,
        }
    }
}

/// Tracks the provisional bundle and wakes waiters when it is confirmed
pub struct ReadinessTracker {
    path: PathBuf,
    signal: watch::Sender<Signal>,
}

impl ReadinessTracker {
    pub fn open(store_root: &Path) -> Result<Self> {
        let path = store_root.join(MARKER_FILE);
        let pending = Self::read_marker(&path)?.map(|state| state.bundle_id);
        let (signal, _) = watch::channel(Signal {
            pending,
            confirmed: None,
        });
        Ok(Self { path, signal })
    }

    /// Current provisional activation, if any
    pub fn provisional(&self) -> Result<Option<ProvisionalState>> {
        Self::read_marker(&self.path)
    }

    /// Record a new provisional activation
    pub fn begin(&self, bundle_id: &str, previous_id: Option<String>) -> Result<ProvisionalState> {
        let state = ProvisionalState {
            bundle_id: bundle_id.to_string(),
            previous_id,
            activated_at: Utc::now(),
            launch_attempts: 0,
        };
        self.write_marker(&state)?;
        self.signal.send_modify(|signal| {
            signal.pending = Some(state.bundle_id.clone());
            if signal.confirmed.as_deref() == Some(state.bundle_id.as_str()) {
                signal.confirmed = None;
            }
        });
        debug!(bundle_id, "Bundle is provisional");
        Ok(state)
    }

    /// Host signal: the provisional bundle started. Returns the confirmed state.
    pub fn confirm(&self) -> Result<Option<ProvisionalState>> {
        let state = self.provisional()?;
        if let Some(state) = &state {
            self.remove_marker()?;
            info!(bundle_id = %state.bundle_id, "Bundle confirmed ready");
        }
        self.signal.send_modify(|signal| {
            signal.pending = None;
            if let Some(state) = &state {
                signal.confirmed = Some(state.bundle_id.clone());
            }
        });
        Ok(state)
    }

    /// Count a launch on the provisional bundle
    pub fn on_launch(&self) -> Result<Option<ProvisionalState>> {
        let Some(mut state) = self.provisional()? else {
            return Ok(None);
        };
        state.launch_attempts += 1;
        self.write_marker(&state)?;
        debug!(bundle_id = %state.bundle_id, attempts = state.launch_attempts, "Unconfirmed launch");
        Ok(Some(state))
    }

    /// Drop the marker without confirming
    pub fn clear(&self) -> Result<()> {
        self.remove_marker()?;
        self.signal.send_modify(|signal| signal.pending = None);
        Ok(())
    }

    /// Wait until `bundle_id` is no longer pending. `None` on timeout.
    pub async fn wait_ready(&self, bundle_id: &str, timeout: Duration) -> Option<ReadyOutcome> {
        let mut rx = self.signal.subscribe();
        let settled = rx.wait_for(|signal| signal.pending.as_deref() != Some(bundle_id));
        let outcome = match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(signal)) => Some(signal.outcome_for(bundle_id)),
            // The sender lives as long as the tracker
            Ok(Err(_)) => Some(ReadyOutcome::Cleared),
            Err(_) => None,
        };
        outcome
    }

    fn read_marker(path: &Path) -> Result<Option<ProvisionalState>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_marker(&self, state: &ProvisionalState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        write_atomically(&self.path.with_extension("tmp"), &self.path, &content)
    }

    fn remove_marker(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
