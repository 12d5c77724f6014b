//! Feed fetcher for epgshift.
//!
//! Retrieves raw XMLTV guide feeds over HTTP with conditional requests,
//! bounded retries with exponential backoff, and per-run coalescing of
//! requests that target the same feed URL.

mod api;
mod client;
mod error;
mod retry;
mod types;

#[allow(clippy::module_name_repetitions)]
pub use api::{FeedSource, LocalFeedSource};
#[allow(clippy::module_name_repetitions)]
pub use client::{FeedClient, FeedClientBuilder};
#[allow(clippy::module_name_repetitions)]
pub use error::FetchError;
pub use retry::RetryPolicy;
pub use types::{CachedFeed, FetchRequest, FetchedFeed, Freshness, Validators, content_hash};
