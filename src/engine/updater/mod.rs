//! LiveUpdate Bundle Updater
//!
//! A rollback-safe, cryptographically verified over-the-air bundle system.
//!
//! Components:
//! - `version` - Semantic version decisions
//! - `security` - URL policy, checksums, signatures, path confinement
//! - `bundle` - Bundle records and the status state machine
//! - `store` - Durable bundle store with an atomic active pointer
//! - `archive` - Tarball unpacking
//! - `download` - HTTP download with retry
//! - `source` - Update metadata source
//! - `readiness` - Provisional activation tracking
//! - `live` - The update engine

pub mod archive;
pub mod bundle;
pub mod download;
pub mod live;
pub mod readiness;
pub mod security;
pub mod source;
pub mod store;
pub mod version;

pub use bundle::{Bundle, BundleManifest, BundleStatus, UpdateCheckResult};
pub use live::{LaunchOutcome, LiveUpdateEngine};
pub use readiness::ReadyOutcome;
pub use security::{ChecksumAlgorithm, SecurityPolicy, SecurityValidator};
pub use source::{HttpMetadataSource, MetadataSource};
pub use store::BundleStore;
pub use version::VersionManager;
