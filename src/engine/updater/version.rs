//! Version Comparison
//!
//! Semantic-version ordering and update decisions. Pure, no I/O.

use semver::Version;
use std::cmp::Ordering;

use crate::engine::error::{Result, UpdateError};

pub struct VersionManager;

impl VersionManager {
    /// Parse a version, tolerating a leading `v`
    pub fn parse(version: &str) -> Result<Version> {
        let trimmed = version.trim();
        Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed))
            .map_err(|e| UpdateError::Parse(format!("{}: {}", version, e)))
    }

    /// Order two versions. Pre-release sorts below the matching release.
    pub fn compare(a: &str, b: &str) -> Result<Ordering> {
        let a = Self::parse(a)?;
        let b = Self::parse(b)?;
        // Build metadata carries no precedence.
        Ok(a.cmp_precedence(&b))
    }

    /// True when `candidate` is strictly newer than `current`
    pub fn should_update(current: &str, candidate: &str) -> Result<bool> {
        Ok(Self::compare(candidate, current)? == Ordering::Greater)
    }

    /// True when `candidate` is strictly older than `current`
    pub fn is_downgrade(current: &str, candidate: &str) -> Result<bool> {
        Ok(Self::compare(candidate, current)? == Ordering::Less)
    }

    /// Check a bundle's minimum binary requirement against the running binary
    pub fn is_compatible(min_binary_version: Option<&str>, binary_version: &str) -> Result<bool> {
        match min_binary_version {
            Some(min) => Ok(Self::compare(binary_version, min)? != Ordering::Less),
            None => Ok(true),
        }
    }
}
