//! Channel and run error taxonomy.

use epgshift_feed::FetchError;
use epgshift_guide::{NormalizeError, ParseError};
use serde::Serialize;

/// Category of a channel failure, as recorded in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelErrorKind {
    /// Feed could not be retrieved.
    FetchUnavailable,
    /// Feed is not a readable XMLTV document.
    ParseMalformed,
    /// Offset could not be applied.
    NormalizeFailed,
    /// Output could not be written.
    WriteFailed,
    /// The run was cancelled first.
    Cancelled,
    /// The channel task panicked.
    Panicked,
}

/// A failure that ended one channel's processing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct ChannelError {
    /// Category.
    pub kind: ChannelErrorKind,
    /// Human-readable cause.
    pub detail: String,
}

impl ChannelError {
    /// Creates an error of `kind`.
    pub fn new(kind: ChannelErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<FetchError> for ChannelError {
    fn from(err: FetchError) -> Self {
        let kind = match err {
            FetchError::Unavailable { .. } => ChannelErrorKind::FetchUnavailable,
            FetchError::Cancelled { .. } => ChannelErrorKind::Cancelled,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ParseError> for ChannelError {
    fn from(err: ParseError) -> Self {
        Self::new(ChannelErrorKind::ParseMalformed, err.to_string())
    }
}

impl From<NormalizeError> for ChannelError {
    fn from(err: NormalizeError) -> Self {
        Self::new(ChannelErrorKind::NormalizeFailed, err.to_string())
    }
}

/// Run-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// Nothing was processed successfully.
    #[error("run aborted: {0}")]
    Aborted(String),
}
