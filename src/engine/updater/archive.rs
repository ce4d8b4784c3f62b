//! Archive Extraction
//!
//! Unpacks gzip tarball bundles. Every entry path is checked against the
//! validator before anything is written.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;

use super::security::SecurityValidator;
use crate::engine::error::{IntegrityFailure, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True if the file starts with the gzip magic bytes
pub fn is_gzip(path: &Path) -> Result<bool> {
    let mut header = [0u8; 2];
    let mut file = File::open(path)?;
    let read = file.read(&mut header)?;
    Ok(read == 2 && header == GZIP_MAGIC)
}

/// Extract `artifact` into `dest` when it is a gzip tarball.
/// Returns `None` for other artifact formats.
pub fn unpack_if_archive(
    artifact: &Path,
    dest: &Path,
    validator: &SecurityValidator,
) -> Result<Option<PathBuf>> {
    if !is_gzip(artifact)? {
        return Ok(None);
    }
    if !validator.validate_path(dest) {
        return Err(IntegrityFailure::UnsafePath(dest.display().to_string()).into());
    }

    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;

    let result = extract(artifact, dest, validator);
    if result.is_err() {
        let _ = fs::remove_dir_all(dest);
    }
    result.map(|count| {
        debug!(entries = count, dest = %dest.display(), "Unpacked bundle archive");
        Some(dest.to_path_buf())
    })
}

fn extract(artifact: &Path, dest: &Path, validator: &SecurityValidator) -> Result<usize> {
    let decoder = GzDecoder::new(BufReader::new(File::open(artifact)?));
    let mut archive = Archive::new(decoder);
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        let target = dest.join(&relative);
        if relative.is_absolute() || !validator.validate_path(&target) {
            return Err(IntegrityFailure::UnsafePath(relative.display().to_string()).into());
        }
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(IntegrityFailure::UnsafePath(relative.display().to_string()).into());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        count += 1;
    }
    Ok(count)
}
