//! Data directory layout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::processed::ProcessedArea;
use crate::reports::ReportArea;
use crate::snapshots::RawArea;

/// Default offset file name inside the data directory.
const OFFSETS_FILE: &str = "channel-offsets.json";

/// Turns a channel id into a file name stem.
///
/// Ids made only of ASCII letters, digits, `-`, `_` and `.` are used as is.
/// Anything else is replaced by `_` and suffixed with the first 8 hex
/// digits of the id's SHA-256, so distinct ids never share a stem.
#[must_use]
pub fn channel_file_stem(channel_id: &str) -> String {
    let safe: String = channel_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe == channel_id && !safe.is_empty() && !safe.starts_with('.') {
        return safe;
    }

    let digest = format!("{:x}", Sha256::digest(channel_id.as_bytes()));
    let short = digest.get(..8).unwrap_or(&digest);
    format!("{}-{short}", safe.trim_start_matches('.'))
}

/// On-disk areas under one data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Creates the layout rooted at `root`, creating the directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Self { root: root.into() };
        for dir in [
            layout.raw_dir(),
            layout.raw_dir().join("blobs"),
            layout.processed_dir(),
            layout.reports_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(layout)
    }

    /// Data directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Default offset file path.
    #[must_use]
    pub fn default_offsets_file(&self) -> PathBuf {
        self.root.join(OFFSETS_FILE)
    }

    fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Raw snapshot area.
    #[must_use]
    pub fn raw(&self) -> RawArea {
        RawArea::new(self.raw_dir())
    }

    /// Processed guide area.
    #[must_use]
    pub fn processed(&self) -> ProcessedArea {
        ProcessedArea::new(self.processed_dir())
    }

    /// Run report area.
    #[must_use]
    pub fn reports(&self) -> ReportArea {
        ReportArea::new(self.reports_dir())
    }
}
