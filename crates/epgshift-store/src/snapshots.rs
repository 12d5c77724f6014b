//! Raw feed snapshots.
//!
//! Each channel has a small JSON metadata file naming a content-addressed
//! blob (`blobs/<sha256>.xml`). Channels sharing a combined feed share one
//! blob. A snapshot is only committed after its bytes parsed, so the last
//! known good copy survives a bad download.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atomic::write_atomic;
use crate::layout::channel_file_stem;

/// Metadata of one channel's last good raw feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Channel identifier.
    pub channel_id: String,
    /// Feed URL the bytes came from.
    pub url: String,
    /// When the feed was retrieved.
    pub fetched_at: DateTime<Utc>,
    /// `ETag` response header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// `Last-Modified` response header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// SHA-256 hex digest of the blob.
    pub content_hash: String,
    /// Blob size in bytes.
    pub byte_len: usize,
}

/// Metadata plus the raw bytes it points to.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Metadata.
    pub meta: SnapshotMeta,
    /// Raw feed bytes.
    pub body: Vec<u8>,
}

/// Raw snapshot directory.
#[derive(Debug, Clone)]
pub struct RawArea {
    dir: PathBuf,
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

impl RawArea {
    /// Creates the area rooted at `dir`.
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn meta_path(&self, channel_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", channel_file_stem(channel_id)))
    }

    fn blobs_dir(&self) -> PathBuf {
        self.dir.join("blobs")
    }

    fn blob_path(&self, content_hash: &str) -> PathBuf {
        self.blobs_dir().join(format!("{content_hash}.xml"))
    }

    /// Loads a channel's last good snapshot.
    ///
    /// Returns `None` when there is none, or when the metadata or blob is
    /// unreadable or does not match its hash.
    ///
    /// # Errors
    ///
    /// Returns an error only for unexpected I/O failures on the metadata
    /// file.
    pub fn load(&self, channel_id: &str) -> Result<Option<Snapshot>> {
        let meta_path = self.meta_path(channel_id);
        let json = match std::fs::read_to_string(&meta_path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read {}", meta_path.display()));
            }
        };

        let meta: SnapshotMeta = match serde_json::from_str(&json) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(channel = channel_id, error = %e, "Ignoring unreadable snapshot metadata");
                return Ok(None);
            }
        };

        let body = match std::fs::read(self.blob_path(&meta.content_hash)) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(channel = channel_id, error = %e, "Snapshot blob missing");
                return Ok(None);
            }
        };

        if sha256_hex(&body) != meta.content_hash {
            tracing::warn!(channel = channel_id, "Snapshot blob does not match its hash");
            return Ok(None);
        }

        Ok(Some(Snapshot { meta, body }))
    }

    /// Records `body` as the channel's last good snapshot.
    ///
    /// The blob is written first (skipped when it already exists), then the
    /// metadata is replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the hash does not match `body` or a write fails.
    pub fn commit(&self, meta: &SnapshotMeta, body: &[u8]) -> Result<()> {
        anyhow::ensure!(
            sha256_hex(body) == meta.content_hash,
            "content hash mismatch for channel {}",
            meta.channel_id
        );

        let blob = self.blob_path(&meta.content_hash);
        if !blob.is_file() {
            write_atomic(&blob, body)?;
        }

        let json = serde_json::to_vec_pretty(meta).context("failed to serialize snapshot")?;
        write_atomic(&self.meta_path(&meta.channel_id), &json)?;

        tracing::debug!(
            channel = %meta.channel_id,
            content_hash = %meta.content_hash,
            "Snapshot committed"
        );
        Ok(())
    }

    fn referenced_hashes(&self) -> Result<HashSet<String>> {
        let mut hashes = HashSet::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        for entry in entries {
            let path = entry.context("failed to read raw directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let meta = std::fs::read_to_string(&path)
                .ok()
                .and_then(|json| serde_json::from_str::<SnapshotMeta>(&json).ok());
            match meta {
                Some(meta) => {
                    hashes.insert(meta.content_hash);
                }
                None => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable snapshot metadata");
                }
            }
        }
        Ok(hashes)
    }

    /// Deletes blobs no snapshot refers to. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed or a blob cannot be
    /// removed.
    pub fn prune(&self) -> Result<usize> {
        let blobs_dir = self.blobs_dir();
        if !blobs_dir.is_dir() {
            return Ok(0);
        }

        let referenced = self.referenced_hashes()?;
        let mut removed: usize = 0;
        let entries = std::fs::read_dir(&blobs_dir)
            .with_context(|| format!("failed to list {}", blobs_dir.display()))?;
        for entry in entries {
            let path = entry.context("failed to read blob directory entry")?.path();
            let Some(hash) = blob_hash(&path) else {
                continue;
            };
            if referenced.contains(hash) {
                continue;
            }
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            removed = removed.saturating_add(1);
        }

        tracing::debug!(removed, "Unreferenced raw blobs pruned");
        Ok(removed)
    }
}

/// Hash part of a `blobs/<hash>.xml` path.
fn blob_hash(path: &Path) -> Option<&str> {
    if path.extension().and_then(|e| e.to_str()) != Some("xml") {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str())
}
