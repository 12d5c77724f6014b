//! Per-channel processing task.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use epgshift_feed::{CachedFeed, FeedSource, FetchRequest, FetchedFeed, Validators, content_hash};
use epgshift_guide::{GuideDocument, SourceMeta, normalize, parse_guide, render_guide};
use epgshift_store::{ProcessedArea, ProcessedOutput, RawArea, SnapshotMeta};
use tokio_util::sync::CancellationToken;

use super::catalog::Channel;
use super::error::{ChannelError, ChannelErrorKind};
use super::report::{ChannelRecord, ChannelStatus, FeedOrigin};
use super::scope::ResolvedOffset;

/// Processing step of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for a concurrency slot.
    Pending,
    /// Retrieving the raw feed.
    Fetching,
    /// Parsing and validating.
    Parsing,
    /// Applying the offset.
    Normalizing,
    /// Writing the processed guide.
    Writing,
    /// Finished with output written.
    Done,
    /// Finished without output.
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Normalizing => "normalizing",
            Self::Writing => "writing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks and logs a channel's state transitions.
#[derive(Debug)]
struct Progress<'a> {
    channel: &'a str,
    state: ChannelState,
}

impl<'a> Progress<'a> {
    const fn new(channel: &'a str) -> Self {
        Self {
            channel,
            state: ChannelState::Pending,
        }
    }

    fn advance(&mut self, next: ChannelState) {
        tracing::debug!(
            channel = self.channel,
            from = %self.state,
            to = %next,
            "Channel state changed"
        );
        self.state = next;
    }
}

/// State shared by every channel task of a run.
#[derive(Debug)]
pub struct TaskContext<S> {
    /// Feed source.
    pub source: Arc<S>,
    /// Raw snapshot area.
    pub raw: RawArea,
    /// Processed output area.
    pub processed: ProcessedArea,
    /// Bypass conditional requests.
    pub force: bool,
    /// Also write `.xml.gz`.
    pub gzip: bool,
    /// Run cancellation.
    pub cancel: CancellationToken,
}

/// One channel with the offset to apply.
#[derive(Debug, Clone)]
pub struct ChannelJob {
    /// Channel.
    pub channel: Channel,
    /// Resolved offset.
    pub offset: ResolvedOffset,
}

impl ChannelJob {
    /// Failed record for a channel that never ran.
    #[must_use]
    pub fn cancelled(&self) -> ChannelRecord {
        ChannelRecord::failed(
            self.channel.id.clone(),
            self.offset.seconds,
            self.offset.source,
            0,
            ChannelError::new(ChannelErrorKind::Cancelled, "run cancelled before start"),
        )
    }
}

/// Output of the steps that ran to completion.
struct Processed {
    doc: GuideDocument,
    output: ProcessedOutput,
    feed: FeedOrigin,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

/// Runs one channel to completion. Never fails: errors become a `failed`
/// record.
pub async fn process_channel<S>(ctx: Arc<TaskContext<S>>, job: ChannelJob) -> ChannelRecord
where
    S: FeedSource + Send + Sync + 'static,
{
    let started = Instant::now();
    let mut progress = Progress::new(&job.channel.id);

    if ctx.cancel.is_cancelled() {
        progress.advance(ChannelState::Failed);
        return job.cancelled();
    }

    match run_steps(&ctx, &job, &mut progress).await {
        Ok(Processed { doc, output, feed }) => {
            progress.advance(ChannelState::Done);
            let status = if !doc.rejected.is_empty() {
                ChannelStatus::Partial
            } else if doc.is_empty() {
                ChannelStatus::Empty
            } else {
                ChannelStatus::Success
            };
            tracing::info!(
                channel = %job.channel.id,
                status = ?status,
                programmes = doc.programmes.len(),
                rejected = doc.rejected.len(),
                offset = job.offset.seconds,
                "Channel processed"
            );
            ChannelRecord {
                channel_id: job.channel.id.clone(),
                status,
                programmes: doc.programmes.len(),
                rejected: doc.rejected.len(),
                offset_seconds: job.offset.seconds,
                offset_source: job.offset.source,
                duration_ms: elapsed_ms(started),
                output: Some(output.xml),
                gzip_output: output.gzip,
                content_hash: Some(doc.source.content_hash),
                feed: Some(feed),
                error: None,
            }
        }
        Err(err) => {
            progress.advance(ChannelState::Failed);
            tracing::warn!(
                channel = %job.channel.id,
                kind = ?err.kind,
                detail = %err.detail,
                "Channel failed"
            );
            ChannelRecord::failed(
                job.channel.id.clone(),
                job.offset.seconds,
                job.offset.source,
                elapsed_ms(started),
                err,
            )
        }
    }
}

/// Last good snapshot for the channel, when it came from the same URL.
fn cached_feed(raw: &RawArea, channel: &Channel) -> Option<CachedFeed> {
    let snapshot = match raw.load(&channel.id) {
        Ok(snapshot) => snapshot?,
        Err(e) => {
            tracing::warn!(channel = %channel.id, error = %e, "Failed to read snapshot");
            return None;
        }
    };
    if snapshot.meta.url != channel.url.as_str() {
        return None;
    }
    Some(CachedFeed {
        validators: Validators {
            etag: snapshot.meta.etag,
            last_modified: snapshot.meta.last_modified,
            content_hash: Some(snapshot.meta.content_hash),
        },
        body: Arc::from(snapshot.body),
    })
}

async fn run_steps<S>(
    ctx: &TaskContext<S>,
    job: &ChannelJob,
    progress: &mut Progress<'_>,
) -> Result<Processed, ChannelError>
where
    S: FeedSource + Send + Sync + 'static,
{
    let channel = &job.channel;

    progress.advance(ChannelState::Fetching);
    let cached = cached_feed(&ctx.raw, channel);
    let fetched = ctx
        .source
        .fetch(&FetchRequest {
            channel_id: &channel.id,
            url: &channel.url,
            force: ctx.force,
            cached: cached.as_ref(),
        })
        .await?;
    let feed = FeedOrigin::from(fetched.freshness);

    progress.advance(ChannelState::Parsing);
    let doc = parse_and_commit(ctx.raw.clone(), channel, fetched).await?;

    progress.advance(ChannelState::Normalizing);
    let offset = job.offset.seconds;
    let (doc, xml) = tokio::task::spawn_blocking(move || {
        normalize(doc, offset).map(|doc| {
            let xml = render_guide(&doc, offset);
            (doc, xml)
        })
    })
    .await
    .map_err(|e| ChannelError::new(ChannelErrorKind::NormalizeFailed, e.to_string()))??;

    progress.advance(ChannelState::Writing);
    let processed = ctx.processed.clone();
    let channel_id = channel.id.clone();
    let gzip = ctx.gzip;
    let output = tokio::task::spawn_blocking(move || processed.write(&channel_id, &xml, gzip))
        .await
        .map_err(|e| ChannelError::new(ChannelErrorKind::WriteFailed, e.to_string()))?
        .map_err(|e| ChannelError::new(ChannelErrorKind::WriteFailed, format!("{e:#}")))?;

    Ok(Processed { doc, output, feed })
}

/// Parses the feed and, on success, records it as the last good snapshot.
async fn parse_and_commit(
    raw: RawArea,
    channel: &Channel,
    fetched: FetchedFeed,
) -> Result<GuideDocument, ChannelError> {
    let channel_id = channel.id.clone();
    let url = String::from(channel.url.as_str());

    tokio::task::spawn_blocking(move || -> Result<GuideDocument, ChannelError> {
        let body = fetched.body;
        let hash = fetched
            .validators
            .content_hash
            .unwrap_or_else(|| content_hash(&body));
        let source = SourceMeta {
            fetched_at: fetched.fetched_at,
            byte_len: body.len(),
            content_hash: hash.clone(),
        };

        let doc = parse_guide(&body, &channel_id, source)?;

        let meta = SnapshotMeta {
            channel_id,
            url,
            fetched_at: fetched.fetched_at,
            etag: fetched.validators.etag,
            last_modified: fetched.validators.last_modified,
            content_hash: hash,
            byte_len: body.len(),
        };
        if let Err(e) = raw.commit(&meta, &body) {
            tracing::warn!(channel = %meta.channel_id, error = %e, "Failed to save raw snapshot");
        }
        Ok(doc)
    })
    .await
    .map_err(|e| ChannelError::new(ChannelErrorKind::ParseMalformed, e.to_string()))?
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use epgshift_feed::{FetchError, Freshness};
    use epgshift_store::DataLayout;
    use url::Url;

    use super::*;
    use crate::pipeline::scope::OffsetSource;

    const FEED: &str = include_str!("../../../../fixtures/xmltv/combined.xml");

    /// Serves a fixed body, or fails, and counts calls.
    struct MockFeedSource {
        body: Option<&'static str>,
        calls: AtomicU32,
        saw_cached: AtomicU32,
    }

    impl MockFeedSource {
        fn serving(body: &'static str) -> Self {
            Self {
                body: Some(body),
                calls: AtomicU32::new(0),
                saw_cached: AtomicU32::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                body: None,
                calls: AtomicU32::new(0),
                saw_cached: AtomicU32::new(0),
            }
        }
    }

    impl FeedSource for MockFeedSource {
        async fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedFeed, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.cached.is_some() {
                self.saw_cached.fetch_add(1, Ordering::SeqCst);
            }
            let Some(body) = self.body else {
                return Err(FetchError::Unavailable {
                    channel: String::from(request.channel_id),
                    attempts: 3,
                    cause: String::from("HTTP 503 Service Unavailable"),
                });
            };
            Ok(FetchedFeed {
                body: Arc::from(body.as_bytes()),
                fetched_at: Utc::now(),
                validators: Validators {
                    etag: Some(String::from("\"v1\"")),
                    last_modified: None,
                    content_hash: None,
                },
                freshness: Freshness::Live,
            })
        }
    }

    fn context(
        source: MockFeedSource,
        layout: &DataLayout,
    ) -> Arc<TaskContext<MockFeedSource>> {
        Arc::new(TaskContext {
            source: Arc::new(source),
            raw: layout.raw(),
            processed: layout.processed(),
            force: false,
            gzip: false,
            cancel: CancellationToken::new(),
        })
    }

    fn job(id: &str, seconds: i64) -> ChannelJob {
        ChannelJob {
            channel: Channel {
                id: String::from(id),
                name: String::from(id),
                url: Url::parse("http://feeds.local/TV.xml").unwrap(),
            },
            offset: ResolvedOffset {
                seconds,
                source: OffsetSource::Stored,
            },
        }
    }

    #[tokio::test]
    async fn test_channel_success_writes_shifted_guide() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::serving(FEED), &layout);

        // Act
        let record = process_channel(ctx, job("bbc1", 30)).await;

        // Assert
        assert_eq!(record.status, ChannelStatus::Success);
        assert_eq!(record.programmes, 3);
        assert_eq!(record.feed, Some(FeedOrigin::Live));
        let xml = std::fs::read_to_string(record.output.unwrap()).unwrap();
        assert!(xml.contains(r#"start="20240301060030 +0000""#));
        assert!(xml.contains("shifted by +30s"));
    }

    #[tokio::test]
    async fn test_channel_with_rejections_is_partial() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::serving(FEED), &layout);

        // Act
        let record = process_channel(ctx, job("itv", 0)).await;

        // Assert
        assert_eq!(record.status, ChannelStatus::Partial);
        assert_eq!(record.programmes, 1);
        assert_eq!(record.rejected, 3);
    }

    #[tokio::test]
    async fn test_channel_without_programmes_is_empty() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::serving(FEED), &layout);

        // Act
        let record = process_channel(ctx, job("c4", 0)).await;

        // Assert
        assert_eq!(record.status, ChannelStatus::Empty);
        assert!(record.output.unwrap().is_file());
    }

    #[tokio::test]
    async fn test_snapshot_is_offered_on_next_run() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::serving(FEED), &layout);

        // Act
        let _ = process_channel(Arc::clone(&ctx), job("bbc1", 0)).await;
        let _ = process_channel(Arc::clone(&ctx), job("bbc1", 0)).await;

        // Assert
        assert_eq!(ctx.source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.source.saw_cached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_recorded() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::failing(), &layout);

        // Act
        let record = process_channel(ctx, job("bbc1", 0)).await;

        // Assert
        assert_eq!(record.status, ChannelStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.kind, ChannelErrorKind::FetchUnavailable);
        assert!(error.detail.contains("503"));
        assert!(record.output.is_none());
    }

    #[tokio::test]
    async fn test_malformed_feed_is_not_committed() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(
            MockFeedSource::serving(include_str!("../../../../fixtures/xmltv/malformed.xml")),
            &layout,
        );

        // Act
        let record = process_channel(ctx, job("x", 0)).await;

        // Assert
        assert_eq!(record.error.unwrap().kind, ChannelErrorKind::ParseMalformed);
        assert!(layout.raw().load("x").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offset_out_of_range_fails_normalize() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::serving(FEED), &layout);

        // Act
        let record = process_channel(ctx, job("bbc1", i64::MAX)).await;

        // Assert
        assert_eq!(record.error.unwrap().kind, ChannelErrorKind::NormalizeFailed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::create(dir.path()).unwrap();
        let ctx = context(MockFeedSource::serving(FEED), &layout);
        ctx.cancel.cancel();

        // Act
        let record = process_channel(Arc::clone(&ctx), job("bbc1", 0)).await;

        // Assert
        assert_eq!(record.error.unwrap().kind, ChannelErrorKind::Cancelled);
        assert_eq!(ctx.source.calls.load(Ordering::SeqCst), 0);
    }
}
