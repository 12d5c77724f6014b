//! Run orchestration.
//!
//! Resolves every channel's offset from one snapshot of the offset store,
//! runs the channels concurrently, reconciles the store and writes the run
//! report.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use epgshift_feed::FeedSource;
use epgshift_store::{DataLayout, OffsetMap, OffsetStore};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::error::{ChannelError, ChannelErrorKind, RunError};
use super::report::{
    ChannelRecord, ConfigUpdate, ReportBuilder, RunReport, RunSummaryInput, ScopeRecord,
};
use super::scope::{ExplicitOffset, RunScope, resolve_offset};
use super::task::{ChannelJob, TaskContext, process_channel};

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Bypass conditional requests.
    pub force: bool,
    /// Channels processed at the same time.
    pub concurrency: usize,
    /// Also write `.xml.gz`.
    pub gzip: bool,
    /// Cancel the run after this long.
    pub timeout: Option<Duration>,
}

/// A finished run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Report as written.
    pub report: RunReport,
    /// Report file.
    pub report_path: PathBuf,
}

impl RunOutcome {
    /// Why the run counts as aborted, if it does.
    #[must_use]
    pub fn abort_reason(&self) -> Option<RunError> {
        let summary = &self.report.summary;
        if summary.channels == 0 {
            Some(RunError::Aborted(String::from("no channels in scope")))
        } else if self.report.nothing_written() {
            Some(RunError::Aborted(format!(
                "all {} channel(s) failed",
                summary.channels
            )))
        } else {
            None
        }
    }
}

/// Offsets loaded at run start.
#[derive(Debug)]
struct LoadedOffsets {
    map: OffsetMap,
    /// Whether the store read cleanly and may be saved.
    clean: bool,
    warning: Option<String>,
}

/// Loads the offset snapshot. An unreadable store yields an empty mapping
/// and is marked unclean.
fn load_offsets(store: &OffsetStore) -> LoadedOffsets {
    match store.load() {
        Ok(map) => LoadedOffsets {
            map,
            clean: true,
            warning: None,
        },
        Err(e) => {
            tracing::error!(
                path = %store.path().display(),
                error = %e,
                "Offset store unreadable, continuing with no offsets"
            );
            LoadedOffsets {
                map: OffsetMap::new(),
                clean: false,
                warning: Some(format!("{e}; offsets not applied, store left untouched")),
            }
        }
    }
}

fn run_id(started_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        started_at.format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

/// Drives one pipeline run.
#[derive(Debug)]
pub struct Orchestrator<S> {
    source: Arc<S>,
    layout: DataLayout,
    offsets: OffsetStore,
    cancel: CancellationToken,
}

impl<S> Orchestrator<S>
where
    S: FeedSource + Send + Sync + 'static,
{
    /// Creates an orchestrator.
    pub fn new(
        source: S,
        layout: DataLayout,
        offsets: OffsetStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: Arc::new(source),
            layout,
            offsets,
            cancel,
        }
    }

    /// Processes every channel in `scope` and writes the run report.
    ///
    /// Channel failures are recorded, never returned.
    ///
    /// # Errors
    ///
    /// Returns an error only when the report itself cannot be written.
    #[instrument(skip_all, fields(channels = scope.channels.len()))]
    pub async fn run(&self, scope: &RunScope, options: &RunOptions) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let loaded = load_offsets(&self.offsets);
        let mut warnings: Vec<String> = loaded.warning.into_iter().collect();
        let stored = loaded.map;

        tracing::info!(
            channels = scope.channels.len(),
            concurrency = options.concurrency,
            force = options.force,
            "Run started"
        );

        let timer = options.timeout.map(|timeout| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        tracing::warn!(timeout_secs = timeout.as_secs(), "Run timeout reached, cancelling");
                        cancel.cancel();
                    }
                    () = cancel.cancelled() => {}
                }
            })
        });

        let builder = self.execute(scope, options, &stored).await?;

        if let Some(timer) = timer {
            timer.abort();
        }

        let config = self.reconcile(scope.explicit.as_ref(), loaded.clean, &builder, &stored);

        match self.layout.raw().prune() {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Pruned unreferenced raw blobs"),
            Err(e) => warnings.push(format!("raw snapshot prune failed: {e:#}")),
        }

        let report = builder.finalize(RunSummaryInput {
            run_id: run_id(started_at),
            started_at,
            finished_at: Utc::now(),
            scope: ScopeRecord {
                requested: scope.requested.clone(),
                channels: scope.channels.iter().map(|c| c.id.clone()).collect(),
                explicit: scope.explicit.clone(),
            },
            config,
            warnings,
        });

        let mut json = serde_json::to_vec_pretty(&report).context("failed to serialize report")?;
        json.push(b'\n');
        let report_path = self
            .layout
            .reports()
            .write(started_at, &json)
            .context("failed to write run report")?;

        tracing::info!(
            succeeded = report.summary.succeeded,
            partial = report.summary.partial,
            empty = report.summary.empty,
            failed = report.summary.failed,
            programmes = report.summary.total_programmes,
            report = %report_path.display(),
            "Run finished"
        );

        Ok(RunOutcome {
            report,
            report_path,
        })
    }

    /// Runs the channel tasks and collects their records.
    async fn execute(
        &self,
        scope: &RunScope,
        options: &RunOptions,
        stored: &OffsetMap,
    ) -> Result<ReportBuilder> {
        let ctx = Arc::new(TaskContext {
            source: Arc::clone(&self.source),
            raw: self.layout.raw(),
            processed: self.layout.processed(),
            force: options.force,
            gzip: options.gzip,
            cancel: self.cancel.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<ChannelRecord>(scope.channels.len().max(1));

        let collector = tokio::spawn(async move {
            let mut builder = ReportBuilder::new();
            while let Some(record) = rx.recv().await {
                builder.record(record);
            }
            builder
        });

        let mut tasks = JoinSet::new();
        let mut jobs = HashMap::new();
        for channel in &scope.channels {
            let job = ChannelJob {
                channel: channel.clone(),
                offset: resolve_offset(&channel.id, scope.explicit.as_ref(), stored),
            };
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let task_job = job.clone();

            let handle = tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let record = match permit {
                    Some(_permit) => process_channel(ctx, task_job).await,
                    None => task_job.cancelled(),
                };
                if tx.send(record).await.is_err() {
                    tracing::error!("Report collector stopped before all channels finished");
                }
            });
            jobs.insert(handle.id(), job);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let Err(e) = joined else {
                continue;
            };
            let Some(job) = jobs.remove(&e.id()) else {
                continue;
            };
            tracing::error!(channel = %job.channel.id, error = %e, "Channel task panicked");
            let record = ChannelRecord::failed(
                job.channel.id,
                job.offset.seconds,
                job.offset.source,
                0,
                ChannelError::new(ChannelErrorKind::Panicked, e.to_string()),
            );
            if tx.send(record).await.is_err() {
                tracing::error!("Report collector stopped before all channels finished");
            }
        }
        drop(tx);

        collector.await.context("report collector failed")
    }

    /// Persists an explicit offset once its channel produced output.
    fn reconcile(
        &self,
        explicit: Option<&ExplicitOffset>,
        store_clean: bool,
        builder: &ReportBuilder,
        stored: &OffsetMap,
    ) -> ConfigUpdate {
        let Some(explicit) = explicit else {
            return ConfigUpdate::NotRequested;
        };
        if !store_clean {
            tracing::warn!(channel = %explicit.channel_id, "Offset not saved: store is unreadable");
            return ConfigUpdate::SkippedCorrupt;
        }
        let written = builder
            .records()
            .iter()
            .any(|r| r.channel_id == explicit.channel_id && r.status.is_written());
        if !written {
            tracing::warn!(channel = %explicit.channel_id, "Offset not saved: channel failed");
            return ConfigUpdate::SkippedFailed;
        }

        let updated = stored.merge(&explicit.channel_id, explicit.seconds);
        match self.offsets.save(&updated) {
            Ok(()) => {
                tracing::info!(
                    channel = %explicit.channel_id,
                    offset = explicit.seconds,
                    "Offset saved"
                );
                ConfigUpdate::Saved {
                    channel: explicit.channel_id.clone(),
                    offset: explicit.seconds,
                }
            }
            Err(e) => {
                tracing::error!(channel = %explicit.channel_id, error = %e, "Failed to save offset");
                ConfigUpdate::Failed {
                    detail: e.to_string(),
                }
            }
        }
    }
}
