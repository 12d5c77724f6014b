//! Run report accumulation.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use epgshift_feed::Freshness;
use serde::Serialize;

use super::error::{ChannelError, ChannelErrorKind};
use super::scope::{ExplicitOffset, OffsetSource};

/// Final state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Written with every programme valid.
    Success,
    /// Written, but some programmes were rejected.
    Partial,
    /// Written with zero programmes.
    Empty,
    /// Not written.
    Failed,
}

impl ChannelStatus {
    /// Whether the processed file was written.
    #[must_use]
    pub const fn is_written(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Empty => "empty",
            Self::Failed => "failed",
        })
    }
}

/// How the raw feed was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOrigin {
    /// Downloaded in this run.
    Live,
    /// Cached copy confirmed by `304 Not Modified`.
    NotModified,
}

impl From<Freshness> for FeedOrigin {
    fn from(freshness: Freshness) -> Self {
        match freshness {
            Freshness::Live => Self::Live,
            Freshness::NotModified => Self::NotModified,
        }
    }
}

/// Error details of a failed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// Category.
    pub kind: ChannelErrorKind,
    /// Cause.
    pub detail: String,
}

impl From<ChannelError> for ErrorRecord {
    fn from(err: ChannelError) -> Self {
        Self {
            kind: err.kind,
            detail: err.detail,
        }
    }
}

/// Outcome of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRecord {
    /// Channel identifier.
    pub channel_id: String,
    /// Final status.
    pub status: ChannelStatus,
    /// Programmes written.
    pub programmes: usize,
    /// Programmes rejected during validation.
    pub rejected: usize,
    /// Applied offset in seconds.
    pub offset_seconds: i64,
    /// Origin of the applied offset.
    pub offset_source: OffsetSource,
    /// Wall time spent on the channel.
    pub duration_ms: u64,
    /// Processed XML path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Compressed copy path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gzip_output: Option<PathBuf>,
    /// SHA-256 of the raw feed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// How the raw feed was obtained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedOrigin>,
    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl ChannelRecord {
    /// A failed record with no output.
    #[must_use]
    pub fn failed(
        channel_id: impl Into<String>,
        offset_seconds: i64,
        offset_source: OffsetSource,
        duration_ms: u64,
        error: ChannelError,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            status: ChannelStatus::Failed,
            programmes: 0,
            rejected: 0,
            offset_seconds,
            offset_source,
            duration_ms,
            output: None,
            gzip_output: None,
            content_hash: None,
            feed: None,
            error: Some(error.into()),
        }
    }
}

/// Result of offset store reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConfigUpdate {
    /// No explicit offset was given.
    NotRequested,
    /// The confirmed offset was saved.
    Saved {
        /// Channel identifier.
        channel: String,
        /// Saved offset seconds.
        offset: i64,
    },
    /// The channel failed, so the offset was not confirmed.
    SkippedFailed,
    /// The store could not be read, so it was left untouched.
    SkippedCorrupt,
    /// Saving failed.
    Failed {
        /// Cause.
        detail: String,
    },
}

/// What the run covered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeRecord {
    /// Channel term as given, when a single channel was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested: Option<String>,
    /// Channel ids in scope.
    pub channels: Vec<String>,
    /// Offset supplied for the requested channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit: Option<ExplicitOffset>,
}

/// Aggregate counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: DateTime<Utc>,
    /// Wall time.
    pub duration_ms: u64,
    /// Channels in scope.
    pub channels: usize,
    /// `success` count.
    pub succeeded: usize,
    /// `partial` count.
    pub partial: usize,
    /// `empty` count.
    pub empty: usize,
    /// `failed` count.
    pub failed: usize,
    /// Programmes written across all channels.
    pub total_programmes: usize,
}

/// Machine-readable result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Aggregates.
    pub summary: RunSummary,
    /// Scope.
    pub scope: ScopeRecord,
    /// Offset store reconciliation.
    pub config: ConfigUpdate,
    /// Run-level warnings.
    pub warnings: Vec<String>,
    /// Per-channel records sorted by channel id.
    pub channels: Vec<ChannelRecord>,
}

impl RunReport {
    /// Whether every channel in scope failed, or there was none.
    #[must_use]
    pub const fn nothing_written(&self) -> bool {
        self.summary.failed == self.summary.channels
    }
}

/// Run-level facts supplied at finalization.
#[derive(Debug, Clone)]
pub struct RunSummaryInput {
    /// Run identifier.
    pub run_id: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Finish time.
    pub finished_at: DateTime<Utc>,
    /// Scope.
    pub scope: ScopeRecord,
    /// Offset store reconciliation.
    pub config: ConfigUpdate,
    /// Run-level warnings.
    pub warnings: Vec<String>,
}

/// Collects channel records during a run.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    records: Vec<ChannelRecord>,
}

impl ReportBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Appends a channel record.
    pub fn record(&mut self, record: ChannelRecord) {
        self.records.push(record);
    }

    /// Records collected so far.
    #[must_use]
    pub fn records(&self) -> &[ChannelRecord] {
        &self.records
    }

    /// Computes aggregates and produces the report.
    #[must_use]
    pub fn finalize(mut self, input: RunSummaryInput) -> RunReport {
        self.records.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        let count = |status: ChannelStatus| {
            self.records
                .iter()
                .filter(|r| r.status == status)
                .count()
        };
        let duration_ms = input
            .finished_at
            .signed_duration_since(input.started_at)
            .num_milliseconds()
            .try_into()
            .unwrap_or(0);

        let summary = RunSummary {
            run_id: input.run_id,
            started_at: input.started_at,
            finished_at: input.finished_at,
            duration_ms,
            channels: self.records.len(),
            succeeded: count(ChannelStatus::Success),
            partial: count(ChannelStatus::Partial),
            empty: count(ChannelStatus::Empty),
            failed: count(ChannelStatus::Failed),
            total_programmes: self
                .records
                .iter()
                .fold(0_usize, |acc, r| acc.saturating_add(r.programmes)),
        };

        RunReport {
            summary,
            scope: input.scope,
            config: input.config,
            warnings: input.warnings,
            channels: self.records,
        }
    }
}
