//! Fetch request and response types.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// Computes the SHA-256 hex digest used as a feed content hash.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Cache validators recorded for a fetched feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// `ETag` response header.
    pub etag: Option<String>,
    /// `Last-Modified` response header.
    pub last_modified: Option<String>,
    /// SHA-256 of the body.
    pub content_hash: Option<String>,
}

impl Validators {
    /// Whether a conditional request can be built from these validators.
    #[must_use]
    pub const fn is_conditional(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Last known-good raw copy of a channel's feed.
#[derive(Debug, Clone)]
pub struct CachedFeed {
    /// Raw bytes.
    pub body: Arc<[u8]>,
    /// Validators recorded when the bytes were fetched.
    pub validators: Validators,
}

/// A request for one channel's feed.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Channel identifier (for logging and errors).
    pub channel_id: &'a str,
    /// Feed URL.
    pub url: &'a Url,
    /// Always perform a live retrieval.
    pub force: bool,
    /// Previous snapshot, if any.
    pub cached: Option<&'a CachedFeed>,
}

/// How the returned bytes were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Downloaded in this run.
    Live,
    /// Server answered `304 Not Modified`; bytes come from the cached snapshot.
    NotModified,
}

/// Raw feed bytes plus retrieval metadata.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    /// Raw bytes.
    pub body: Arc<[u8]>,
    /// When the server was contacted.
    pub fetched_at: DateTime<Utc>,
    /// Validators for the next conditional request.
    pub validators: Validators,
    /// Live download or cached copy.
    pub freshness: Freshness,
}
