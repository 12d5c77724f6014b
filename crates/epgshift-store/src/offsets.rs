//! Channel offset store (`channel-offsets.json`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::atomic::write_atomic;

/// Offset store failures.
#[derive(Debug, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum StoreError {
    /// The file exists but is not a JSON object of channel to integer seconds.
    #[error("offset file {} is corrupt: {message}", path.display())]
    Corrupt {
        /// Offset file path.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },
    /// Reading or writing the file failed.
    #[error("offset file {} could not be accessed: {message}", path.display())]
    Io {
        /// Offset file path.
        path: PathBuf,
        /// Underlying error, with its context chain.
        message: String,
    },
}

/// Channel identifier to offset seconds. Keys are kept sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OffsetMap(BTreeMap<String, i64>);

impl OffsetMap {
    /// Creates an empty mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Stored offset for `channel`, if any.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<i64> {
        self.0.get(channel).copied()
    }

    /// Stored offset for `channel`, or 0.
    #[must_use]
    pub fn offset_for(&self, channel: &str) -> i64 {
        self.get(channel).unwrap_or(0)
    }

    /// Returns a copy with `channel` set to `offset`. Other entries are
    /// untouched.
    #[must_use]
    pub fn merge(&self, channel: &str, offset: i64) -> Self {
        let mut merged = self.0.clone();
        merged.insert(String::from(channel), offset);
        Self(merged)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, i64)> for OffsetMap {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct OffsetMapVisitor;

impl<'de> Visitor<'de> for OffsetMapVisitor {
    type Value = OffsetMap;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object mapping channel ids to integer seconds")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((channel, offset)) = access.next_entry::<String, i64>()? {
            if entries.contains_key(&channel) {
                return Err(serde::de::Error::custom(format!(
                    "duplicate channel {channel:?}"
                )));
            }
            entries.insert(channel, offset);
        }
        Ok(OffsetMap(entries))
    }
}

impl<'de> Deserialize<'de> for OffsetMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(OffsetMapVisitor)
    }
}

/// File-backed offset store.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct OffsetStore {
    path: PathBuf,
}

impl OffsetStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the mapping.
    ///
    /// A missing or blank file yields an empty mapping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the content is not a JSON object
    /// of unique channel ids to integers, and [`StoreError::Io`] if the file
    /// cannot be read.
    pub fn load(&self) -> Result<OffsetMap, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "Offset file not found, using empty mapping");
                return Ok(OffsetMap::new());
            }
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    message: e.to_string(),
                });
            }
        };

        let text = std::str::from_utf8(&bytes).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        if text.trim().is_empty() {
            return Ok(OffsetMap::new());
        }

        let map: OffsetMap = serde_json::from_str(text).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        tracing::debug!(path = %self.path.display(), entries = map.len(), "Offsets loaded");
        Ok(map)
    }

    /// Persists the mapping as pretty JSON, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be written.
    pub fn save(&self, map: &OffsetMap) -> Result<(), StoreError> {
        let io_err = |message: String| StoreError::Io {
            path: self.path.clone(),
            message,
        };
        let mut json = serde_json::to_string_pretty(map).map_err(|e| io_err(e.to_string()))?;
        json.push('\n');
        write_atomic(&self.path, json.as_bytes()).map_err(|e| io_err(format!("{e:#}")))?;
        tracing::debug!(path = %self.path.display(), entries = map.len(), "Offsets saved");
        Ok(())
    }
}
