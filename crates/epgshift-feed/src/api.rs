//! `FeedSource` trait definition.
#![allow(clippy::future_not_send)]

use super::error::FetchError;
use super::types::{FetchRequest, FetchedFeed};

/// Guide feed source.
///
/// Abstracts feed retrieval for mock substitution in tests.
/// Uses `trait_variant::make` to generate a `Send`-bound async trait.
#[allow(clippy::module_name_repetitions)]
#[trait_variant::make(FeedSource: Send)]
pub trait LocalFeedSource {
    /// Fetches the raw feed for one channel.
    ///
    /// When `request.force` is false and `request.cached` carries an ETag or
    /// Last-Modified validator, the source may answer with the cached bytes
    /// instead of downloading the feed again.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Unavailable`] once retries are exhausted or the
    /// server answers with a non-retryable status, and
    /// [`FetchError::Cancelled`] when the run is cancelled.
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedFeed, FetchError>;
}
