//! Atomic file replacement.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// Writes `contents` to a temp file beside `path`, syncs it and returns it.
fn staged(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    Ok(tmp)
}

/// Replaces `path` with `contents`. Readers see either the old file or the
/// new one, never a partial write.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the temp file
/// cannot be written, synced or renamed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = staged(path, contents)?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Creates `path` with `contents`, failing if it already exists.
///
/// Returns `Ok(false)` when `path` is taken.
///
/// # Errors
///
/// Returns an error on any I/O failure other than the target existing.
pub fn write_new(path: &Path, contents: &[u8]) -> Result<bool> {
    let tmp = staged(path, contents)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error).with_context(|| format!("failed to create {}", path.display())),
    }
}
