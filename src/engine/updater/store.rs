//! Bundle Store
//!
//! Durable record of every installed bundle and its artifact.
//!
//! Layout under the store root:
//! - `index.json`  - id → bundle record
//! - `active`      - id of the active bundle (the single commit point)
//! - `bundles/<id>/bundle.bin` - staged artifact
//! - `bundles/<id>/content/`   - unpacked archive, if any
//! - `staging/`    - in-flight writes, cleared on open
//!
//! A record is created `Downloading` when a fetch starts and becomes
//! `Downloaded` once the artifact is staged. Records left `Downloading` by a
//! crash are marked `Failed` on open.
//!
//! Every write goes to a temp file first and is renamed into place. The
//! `active` pointer is authoritative: records are reconciled against it on
//! open, so a crash mid-activation resolves to exactly one active bundle.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::archive;
use super::bundle::{Bundle, BundleStatus};
use super::security::SecurityValidator;
use crate::engine::error::{Result, UpdateError};

const INDEX_FILE: &str = "index.json";
const ACTIVE_POINTER: &str = "active";
const BUNDLES_DIR: &str = "bundles";
const STAGING_DIR: &str = "staging";
const ARTIFACT_NAME: &str = "bundle.bin";
const CONTENT_DIR: &str = "content";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BundleIndex {
    bundles: BTreeMap<String, Bundle>,
}

impl BundleIndex {
    fn active(&self) -> Option<&Bundle> {
        self.bundles.values().find(|b| b.is_active())
    }

    fn active_id(&self) -> Option<String> {
        self.active().map(|b| b.id.clone())
    }
}

/// Owner of bundle records and artifacts
pub struct BundleStore {
    root: PathBuf,
    validator: SecurityValidator,
    max_bundle_size: u64,
    index: RwLock<BundleIndex>,
}

impl BundleStore {
    /// Open or create a store at `root`
    pub fn open(root: &Path, validator: SecurityValidator) -> Result<Self> {
        fs::create_dir_all(root.join(BUNDLES_DIR))?;
        fs::create_dir_all(root.join(STAGING_DIR))?;

        let max_bundle_size = validator.policy().max_bundle_size;
        let validator = validator.with_writable_root(root);

        let store = Self {
            root: root.to_path_buf(),
            validator,
            max_bundle_size,
            index: RwLock::new(BundleIndex::default()),
        };
        store.cleanup_staging()?;

        let mut index = store.load_index()?;
        if store.reconcile(&mut index)? {
            store.save_index(&index)?;
        }
        debug!(bundles = index.bundles.len(), root = %root.display(), "Opened bundle store");
        *store.write()? = index;

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bundle_dir(&self, id: &str) -> PathBuf {
        self.root.join(BUNDLES_DIR).join(id)
    }

    fn artifact_path(&self, id: &str) -> PathBuf {
        self.bundle_dir(id).join(ARTIFACT_NAME)
    }

    fn pointer_path(&self) -> PathBuf {
        self.root.join(ACTIVE_POINTER)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BundleIndex>> {
        self.index
            .read()
            .map_err(|_| UpdateError::Storage("bundle index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BundleIndex>> {
        self.index
            .write()
            .map_err(|_| UpdateError::Storage("bundle index lock poisoned".to_string()))
    }

    // ========== Queries ==========

    /// The bundle currently serving the app
    pub fn current(&self) -> Result<Bundle> {
        self.read()?
            .active()
            .cloned()
            .ok_or_else(|| UpdateError::NotFound("no active bundle".to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Bundle> {
        self.read()?
            .bundles
            .get(id)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(id.to_string()))
    }

    /// Snapshot of all records, newest first
    pub fn list(&self) -> Result<Vec<Bundle>> {
        let mut bundles: Vec<Bundle> = self.read()?.bundles.values().cloned().collect();
        bundles.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(bundles)
    }

    pub fn read_artifact(&self, id: &str) -> Result<Vec<u8>> {
        let bundle = self.get(id)?;
        let location = bundle
            .location
            .ok_or_else(|| UpdateError::NotFound(format!("artifact for {}", id)))?;
        Ok(fs::read(location)?)
    }

    /// Directory the host should load for a bundle: unpacked content when
    /// present, else the bundle directory
    pub fn load_path(&self, id: &str) -> PathBuf {
        let content = self.bundle_dir(id).join(CONTENT_DIR);
        if content.is_dir() {
            content
        } else {
            self.bundle_dir(id)
        }
    }

    // ========== Staging ==========

    fn checked_id(metadata: &Bundle) -> Result<String> {
        let id = SecurityValidator::sanitize_input(&metadata.id);
        if id.chars().all(|c| c == '.') {
            return Err(UpdateError::Storage(format!("invalid bundle id {:?}", id)));
        }
        Ok(id)
    }

    /// Failed, rolled-back and in-flight records under the same id may be
    /// replaced by a fresh attempt
    fn ensure_unique(index: &BundleIndex, id: &str, metadata: &Bundle) -> Result<()> {
        let duplicate = index.bundles.values().any(|b| {
            let replaceable = b.status.is_terminal()
                || (b.id == id && b.status == BundleStatus::Downloading);
            !replaceable
                && (b.id == id || (b.version == metadata.version && b.channel == metadata.channel))
        });
        if duplicate {
            return Err(UpdateError::Duplicate(format!("{} ({})", id, metadata.version)));
        }
        Ok(())
    }

    /// Record a fetch in flight as `Downloading`
    pub fn begin_download(&self, metadata: &Bundle) -> Result<Bundle> {
        let id = Self::checked_id(metadata)?;
        let mut index = self.write()?;
        Self::ensure_unique(&index, &id, metadata)?;

        let mut record = Bundle {
            id: id.clone(),
            status: BundleStatus::Pending,
            location: None,
            created_at: Utc::now(),
            activated_at: None,
            failure_reason: None,
            ..metadata.clone()
        };
        if !record.status.can_transition_to(BundleStatus::Downloading) {
            return Err(UpdateError::InvalidTransition {
                id,
                from: record.status,
                to: BundleStatus::Downloading,
            });
        }
        record.status = BundleStatus::Downloading;

        let mut next = index.clone();
        next.bundles.insert(id.clone(), record.clone());
        self.save_index(&next)?;
        *index = next;
        debug!(bundle_id = %id, version = %record.version, "Download started");
        Ok(record)
    }

    /// Write an artifact and record it as `Downloaded`. An in-flight
    /// `Downloading` record for the same id is completed in place.
    pub fn stage(&self, bytes: &[u8], metadata: &Bundle) -> Result<Bundle> {
        let size = bytes.len() as u64;
        if size > self.max_bundle_size {
            return Err(UpdateError::size_limit(size, self.max_bundle_size));
        }

        let id = Self::checked_id(metadata)?;
        let mut index = self.write()?;
        Self::ensure_unique(&index, &id, metadata)?;

        let artifact = self.artifact_path(&id);
        let partial = self.root.join(STAGING_DIR).join(format!("{}.partial", id));
        if !self.validator.validate_path(&artifact) || !self.validator.validate_path(&partial) {
            return Err(UpdateError::Storage(format!("path rejected for bundle {}", id)));
        }

        let mut next = index.clone();
        let created_at = match next.bundles.remove(&id) {
            Some(old) if old.status == BundleStatus::Downloading => old.created_at,
            Some(old) => {
                debug!(bundle_id = %id, status = ?old.status, "Replacing terminal record");
                Utc::now()
            }
            None => Utc::now(),
        };
        let bundle_dir = self.bundle_dir(&id);
        if bundle_dir.exists() {
            fs::remove_dir_all(&bundle_dir)?;
        }

        if let Err(e) = write_atomically(&partial, &artifact, bytes) {
            let _ = fs::remove_file(&partial);
            let _ = fs::remove_dir_all(&bundle_dir);
            return Err(e);
        }

        let record = Bundle {
            id: id.clone(),
            status: BundleStatus::Downloaded,
            size_bytes: size,
            location: Some(artifact),
            created_at,
            activated_at: None,
            failure_reason: None,
            ..metadata.clone()
        };

        next.bundles.insert(id.clone(), record.clone());
        if let Err(e) = self.save_index(&next) {
            let _ = fs::remove_dir_all(&bundle_dir);
            return Err(e);
        }
        *index = next;

        info!(bundle_id = %id, version = %record.version, size, "Staged bundle");
        Ok(record)
    }

    // ========== Transitions ==========

    fn transition(
        &self,
        index: &mut BundleIndex,
        id: &str,
        to: BundleStatus,
    ) -> Result<()> {
        let bundle = index
            .bundles
            .get_mut(id)
            .ok_or_else(|| UpdateError::NotFound(id.to_string()))?;
        if !bundle.status.can_transition_to(to) {
            return Err(UpdateError::InvalidTransition {
                id: id.to_string(),
                from: bundle.status,
                to,
            });
        }
        bundle.status = to;
        Ok(())
    }

    pub fn mark_verified(&self, id: &str) -> Result<Bundle> {
        let mut index = self.write()?;
        let mut next = index.clone();
        self.transition(&mut next, id, BundleStatus::Verified)?;
        self.save_index(&next)?;
        *index = next;
        debug!(bundle_id = %id, "Bundle verified");
        self.bundle_from(&index, id)
    }

    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<Bundle> {
        let mut index = self.write()?;
        if index.active_id().as_deref() == Some(id) {
            return Err(UpdateError::InvalidTransition {
                id: id.to_string(),
                from: BundleStatus::Active,
                to: BundleStatus::Failed,
            });
        }
        let mut next = index.clone();
        self.transition(&mut next, id, BundleStatus::Failed)?;
        if let Some(bundle) = next.bundles.get_mut(id) {
            bundle.failure_reason = Some(reason.to_string());
        }
        self.save_index(&next)?;
        *index = next;
        warn!(bundle_id = %id, reason, "Bundle failed");
        self.bundle_from(&index, id)
    }

    /// Mark failed and drop the artifact bytes, keeping the record
    pub fn discard(&self, id: &str, reason: &str) -> Result<Bundle> {
        self.mark_failed(id, reason)?;
        let bundle_dir = self.bundle_dir(id);
        if bundle_dir.exists() {
            fs::remove_dir_all(&bundle_dir)?;
        }
        let mut index = self.write()?;
        let mut next = index.clone();
        if let Some(bundle) = next.bundles.get_mut(id) {
            bundle.location = None;
        }
        self.save_index(&next)?;
        *index = next;
        self.bundle_from(&index, id)
    }

    fn bundle_from(&self, index: &BundleIndex, id: &str) -> Result<Bundle> {
        index
            .bundles
            .get(id)
            .cloned()
            .ok_or_else(|| UpdateError::NotFound(id.to_string()))
    }

    // ========== Activation ==========

    /// Make `id` the active bundle; the previous one becomes `Superseded`
    pub fn activate(&self, id: &str) -> Result<Bundle> {
        let mut index = self.write()?;
        let previous = index.active_id();
        if previous.as_deref() == Some(id) {
            return self.bundle_from(&index, id);
        }

        let mut next = index.clone();
        self.transition(&mut next, id, BundleStatus::Active)?;
        if let Some(prev) = &previous {
            self.transition(&mut next, prev, BundleStatus::Superseded)?;
        }
        if let Some(bundle) = next.bundles.get_mut(id) {
            bundle.activated_at = Some(Utc::now());
        }

        self.write_pointer(Some(id))?;
        self.commit(&mut index, next);

        info!(bundle_id = %id, previous = ?previous, "Activated bundle");
        self.bundle_from(&index, id)
    }

    /// Mark the active bundle `RolledBack` and re-activate the most recently
    /// activated `Superseded` bundle. With no such bundle the pointer is
    /// cleared and `NoFallback` is returned; the caller serves the embedded
    /// bundle.
    pub fn rollback(&self) -> Result<Bundle> {
        let mut index = self.write()?;
        let current = index
            .active_id()
            .ok_or_else(|| UpdateError::NotFound("no active bundle".to_string()))?;

        let fallback = Self::rollback_target(index.bundles.values()).map(|b| b.id.clone());

        let mut next = index.clone();
        self.transition(&mut next, &current, BundleStatus::RolledBack)?;

        match fallback {
            Some(fallback_id) => {
                self.transition(&mut next, &fallback_id, BundleStatus::Active)?;
                if let Some(bundle) = next.bundles.get_mut(&fallback_id) {
                    bundle.activated_at = Some(Utc::now());
                }
                self.write_pointer(Some(&fallback_id))?;
                self.commit(&mut index, next);
                warn!(from = %current, to = %fallback_id, "Rolled back bundle");
                self.bundle_from(&index, &fallback_id)
            }
            None => {
                self.write_pointer(None)?;
                self.commit(&mut index, next);
                warn!(from = %current, "Rolled back to embedded bundle");
                Err(UpdateError::NoFallback)
            }
        }
    }

    /// Drop the active pointer; the embedded bundle serves the app
    pub fn clear_active(&self) -> Result<()> {
        let mut index = self.write()?;
        let Some(current) = index.active_id() else {
            return Ok(());
        };
        let mut next = index.clone();
        self.transition(&mut next, &current, BundleStatus::Superseded)?;
        self.write_pointer(None)?;
        self.commit(&mut index, next);
        Ok(())
    }

    /// Install the new index in memory after the pointer write. A failed
    /// index save is repaired by reconciliation on the next open.
    fn commit(&self, index: &mut BundleIndex, next: BundleIndex) {
        if let Err(e) = self.save_index(&next) {
            warn!(error = %e, "Index save failed after pointer write");
        }
        *index = next;
    }

    // ========== Retention ==========

    /// Remove an inactive bundle and its artifact
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut index = self.write()?;
        if !index.bundles.contains_key(id) {
            return Err(UpdateError::NotFound(id.to_string()));
        }
        if index.active_id().as_deref() == Some(id) {
            return Err(UpdateError::Storage(format!("cannot delete active bundle {}", id)));
        }
        let mut next = index.clone();
        next.bundles.remove(id);
        self.save_index(&next)?;
        *index = next;
        drop(index);

        let bundle_dir = self.bundle_dir(id);
        if bundle_dir.exists() {
            fs::remove_dir_all(&bundle_dir)?;
        }
        debug!(bundle_id = %id, "Deleted bundle");
        Ok(())
    }

    /// The bundle `rollback` would restore
    fn rollback_target<'a>(bundles: impl Iterator<Item = &'a Bundle>) -> Option<&'a Bundle> {
        bundles
            .filter(|b| b.status == BundleStatus::Superseded)
            .max_by(|a, b| a.activated_at.cmp(&b.activated_at))
    }

    /// Keep the `keep_count` newest inactive bundles plus the active one and
    /// the rollback target. Records without an artifact are evicted before
    /// usable ones. Rolled-back records lose their artifact but keep the
    /// record so the release is not offered again. In-flight downloads are
    /// left alone. Returns the pruned ids.
    pub fn prune(&self, keep_count: usize) -> Result<Vec<String>> {
        let bundles = self.list()?;
        let fallback = Self::rollback_target(bundles.iter()).map(|b| b.id.clone());

        let mut candidates: Vec<Bundle> = bundles
            .into_iter()
            .filter(|b| {
                !b.is_active()
                    && b.status != BundleStatus::Downloading
                    && Some(&b.id) != fallback.as_ref()
                    && !(b.status == BundleStatus::RolledBack && b.location.is_none())
            })
            .collect();
        // Stable: newest first within each group
        candidates.sort_by_key(|b| b.status.is_terminal() || b.location.is_none());

        let doomed: Vec<Bundle> = candidates.into_iter().skip(keep_count).collect();
        for bundle in &doomed {
            if bundle.status == BundleStatus::RolledBack {
                self.drop_artifact(&bundle.id)?;
            } else {
                self.delete(&bundle.id)?;
            }
        }
        if !doomed.is_empty() {
            info!(removed = doomed.len(), keep_count, "Pruned bundles");
        }
        Ok(doomed.into_iter().map(|b| b.id).collect())
    }

    fn drop_artifact(&self, id: &str) -> Result<()> {
        let mut index = self.write()?;
        let mut next = index.clone();
        if let Some(bundle) = next.bundles.get_mut(id) {
            bundle.location = None;
        }
        self.save_index(&next)?;
        *index = next;
        drop(index);

        let bundle_dir = self.bundle_dir(id);
        if bundle_dir.exists() {
            fs::remove_dir_all(&bundle_dir)?;
        }
        debug!(bundle_id = %id, "Dropped rolled-back artifact");
        Ok(())
    }

    /// Remove every record and artifact and clear the pointer
    pub fn reset(&self) -> Result<usize> {
        let mut index = self.write()?;
        self.write_pointer(None)?;
        let removed = index.bundles.len();
        let empty = BundleIndex::default();
        self.save_index(&empty)?;
        *index = empty;

        let bundles_dir = self.root.join(BUNDLES_DIR);
        if bundles_dir.exists() {
            fs::remove_dir_all(&bundles_dir)?;
        }
        fs::create_dir_all(&bundles_dir)?;
        info!(removed, "Reset bundle store");
        Ok(removed)
    }

    /// Extract a verified gzip tarball into `bundles/<id>/content`
    pub fn unpack(&self, id: &str) -> Result<Option<PathBuf>> {
        let bundle = self.get(id)?;
        let Some(location) = bundle.location else {
            return Ok(None);
        };
        let dest = self.bundle_dir(id).join(CONTENT_DIR);
        archive::unpack_if_archive(&location, &dest, &self.validator)
    }

    // ========== Persistence ==========

    fn load_index(&self) -> Result<BundleIndex> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(BundleIndex::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_index(&self, index: &BundleIndex) -> Result<()> {
        let content = serde_json::to_vec_pretty(index)?;
        let path = self.root.join(INDEX_FILE);
        write_atomically(&path.with_extension("tmp"), &path, &content)
    }

    fn read_pointer(&self) -> Result<Option<String>> {
        let path = self.pointer_path();
        if !path.exists() {
            return Ok(None);
        }
        let id = fs::read_to_string(&path)?.trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    fn write_pointer(&self, id: Option<&str>) -> Result<()> {
        let path = self.pointer_path();
        match id {
            Some(id) => write_atomically(&path.with_extension("tmp"), &path, id.as_bytes()),
            None => {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                Ok(())
            }
        }
    }

    /// Align record statuses with the pointer. Returns true if anything changed.
    fn reconcile(&self, index: &mut BundleIndex) -> Result<bool> {
        let mut pointer = self.read_pointer()?;
        if let Some(id) = &pointer {
            let usable = index
                .bundles
                .get(id)
                .map(|b| !b.status.is_terminal() && b.location.is_some())
                .unwrap_or(false);
            if !usable {
                warn!(bundle_id = %id, "Active pointer references unusable bundle, clearing");
                self.write_pointer(None)?;
                pointer = None;
            }
        }

        let mut changed = false;
        for bundle in index.bundles.values_mut() {
            if bundle.status == BundleStatus::Downloading {
                warn!(bundle_id = %bundle.id, "Download interrupted, marking failed");
                bundle.status = BundleStatus::Failed;
                bundle.failure_reason = Some("download interrupted".to_string());
                changed = true;
                continue;
            }
            let should_be_active = pointer.as_deref() == Some(bundle.id.as_str());
            if should_be_active && bundle.status != BundleStatus::Active {
                bundle.status = BundleStatus::Active;
                bundle.activated_at.get_or_insert_with(Utc::now);
                changed = true;
            } else if !should_be_active && bundle.status == BundleStatus::Active {
                bundle.status = BundleStatus::Superseded;
                changed = true;
            }
        }
        if changed {
            info!(active = ?pointer, "Reconciled bundle index with active pointer");
        }
        Ok(changed)
    }

    fn cleanup_staging(&self) -> Result<()> {
        for entry in fs::read_dir(self.root.join(STAGING_DIR))? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Write to `temp`, flush to disk, then rename over `dest`
pub(crate) fn write_atomically(temp: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = temp.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp, dest)?;
    Ok(())
}
