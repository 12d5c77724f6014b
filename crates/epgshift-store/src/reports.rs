//! Run report files.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

use crate::atomic::write_new;

/// Upper bound on `-N` suffixes tried for one timestamp.
const MAX_SUFFIX: u32 = 1_000;

/// Run report directory. Existing reports are never overwritten.
#[derive(Debug, Clone)]
pub struct ReportArea {
    dir: PathBuf,
}

impl ReportArea {
    /// Creates the area rooted at `dir`.
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Writes a report named after the run start time.
    ///
    /// Uses `run-<YYYYMMDDTHHMMSSZ>.json`, then `-1`, `-2`, ... suffixes
    /// when the name is taken.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails or no free name is found.
    pub fn write(&self, started_at: DateTime<Utc>, contents: &[u8]) -> Result<PathBuf> {
        let base = format!("run-{}", started_at.format("%Y%m%dT%H%M%SZ"));

        for suffix in 0..=MAX_SUFFIX {
            let name = if suffix == 0 {
                format!("{base}.json")
            } else {
                format!("{base}-{suffix}.json")
            };
            let path = self.dir.join(name);
            if write_new(&path, contents)? {
                tracing::debug!(path = %path.display(), "Run report written");
                return Ok(path);
            }
        }

        bail!("no free report name for {base} in {}", self.dir.display())
    }
}
