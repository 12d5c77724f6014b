//! Fetch error taxonomy.

/// Failure to obtain a channel's raw feed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum FetchError {
    /// Network, timeout or HTTP failure after the retry budget was spent.
    #[error("feed for channel {channel} unavailable after {attempts} attempt(s): {cause}")]
    Unavailable {
        /// Channel identifier.
        channel: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last observed cause.
        cause: String,
    },
    /// The run was cancelled before the feed could be retrieved.
    #[error("fetch for channel {channel} cancelled")]
    Cancelled {
        /// Channel identifier.
        channel: String,
    },
}
