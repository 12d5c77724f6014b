//! epgshift - per-channel EPG offset normalization CLI.

/// Application configuration (TOML).
mod config;
/// Channel catalog, run scope and the normalization pipeline.
mod pipeline;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use epgshift_feed::{FeedClient, FeedSource, FetchRequest};
use epgshift_guide::list_feed_channels;
use epgshift_store::{DataLayout, OffsetStore};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_subscriber::filter::EnvFilter;
#[cfg(not(feature = "otel"))]
use tracing_subscriber::fmt;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::{AppConfig, AppPaths};
use crate::pipeline::{Catalog, Orchestrator, RunOptions, ScopeRequest, resolve_scope};

/// Number of id prefixes shown by `stats`.
const STATS_PREFIX_LIMIT: usize = 10;

/// CLI argument parser.
#[derive(Parser)]
#[command(about, version)]
struct Cli {
    /// Override config/data directory.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Fetch, shift and write channel guides.
    Run(RunArgs),
    /// Channel catalog operations.
    Channels(ChannelsCommand),
    /// Show catalog and offset statistics.
    Stats,
    /// Offset store operations.
    Offsets(OffsetsCommand),
}

/// Arguments for the `run` subcommand.
#[derive(clap::Args)]
struct RunArgs {
    /// Channel id or name to process (default: every channel).
    #[arg(long)]
    channel: Option<String>,

    /// Offset in seconds to apply to --channel and save on success.
    #[arg(long, requires = "channel", allow_hyphen_values = true)]
    offset: Option<i64>,

    /// Download feeds even when the cached copy is still valid.
    #[arg(long)]
    force: bool,

    /// Cancel the run after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Channels processed at the same time.
    #[arg(long)]
    concurrency: Option<usize>,
}

/// Arguments for the `channels` subcommand.
#[derive(clap::Args)]
struct ChannelsCommand {
    /// Channels subcommand to run.
    #[command(subcommand)]
    command: ChannelsSubcommands,
}

/// Available channels subcommands.
#[derive(Subcommand)]
enum ChannelsSubcommands {
    /// List catalog channels.
    List,
    /// Check that a channel id or name resolves.
    Validate {
        /// Channel id or name.
        term: String,
    },
}

/// Arguments for the `offsets` subcommand.
#[derive(clap::Args)]
struct OffsetsCommand {
    /// Offsets subcommand to run.
    #[command(subcommand)]
    command: OffsetsSubcommands,
}

/// Available offsets subcommands.
#[derive(Subcommand)]
enum OffsetsSubcommands {
    /// List stored channel offsets.
    List,
}

/// Loads the app config for `--dir`.
fn load_config(dir: Option<&PathBuf>) -> Result<AppConfig> {
    let paths = AppPaths::resolve(dir.map(PathBuf::as_path)).context("failed to resolve paths")?;
    AppConfig::load(&paths.config_file).context("failed to load config")
}

/// Creates the data directory layout.
fn open_layout(dir: Option<&PathBuf>, config: &AppConfig) -> Result<DataLayout> {
    let paths = AppPaths::resolve(dir.map(PathBuf::as_path)).context("failed to resolve paths")?;
    DataLayout::create(paths.data_dir_for(config)).context("failed to prepare data directory")
}

/// Offset store configured for `layout`.
fn offset_store(config: &AppConfig, layout: &DataLayout) -> OffsetStore {
    OffsetStore::new(config.offsets_path(layout.root(), layout.default_offsets_file()))
}

fn build_feed_client(config: &AppConfig, cancel: CancellationToken) -> Result<FeedClient> {
    FeedClient::builder()
        .user_agent(config.user_agent())
        .timeout(config.fetch.timeout())
        .retry_policy(config.fetch.retry_policy())
        .cancellation(cancel)
        .build()
        .context("failed to build feed client")
}

/// Builds the catalog from config, or from the channels declared in the
/// source feed when none are configured.
async fn load_catalog(config: &AppConfig, client: &FeedClient) -> Result<Catalog> {
    if !config.channels.is_empty() {
        return Catalog::from_config(config);
    }

    let url = Url::parse(&config.source.url)
        .with_context(|| format!("invalid source URL: {}", config.source.url))?;
    let feed = client
        .fetch(&FetchRequest {
            channel_id: "catalog",
            url: &url,
            force: false,
            cached: None,
        })
        .await
        .context("failed to fetch source feed")?;
    let channels = list_feed_channels(&feed.body).context("failed to read source feed")?;
    tracing::debug!(channels = channels.len(), url = %url, "Channels discovered");
    Ok(Catalog::from_feed(channels, &url))
}

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });
}

/// Runs the `run` subcommand.
///
/// # Errors
///
/// Returns an error if the config, catalog or scope cannot be resolved, the
/// report cannot be written, or the run is aborted.
#[instrument(skip_all)]
async fn run_pipeline(args: &RunArgs, dir: Option<&PathBuf>) -> Result<()> {
    let config = load_config(dir)?;
    let layout = open_layout(dir, &config)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let client = build_feed_client(&config, cancel.clone())?;
    let catalog = load_catalog(&config, &client).await?;

    let request = args
        .channel
        .as_ref()
        .map_or(ScopeRequest::All, |term| ScopeRequest::Channel {
            term: term.clone(),
            offset: args.offset,
        });
    let scope = resolve_scope(&catalog, &request)?;

    let options = RunOptions {
        force: args.force,
        concurrency: args.concurrency.unwrap_or(config.run.concurrency),
        gzip: config.run.gzip,
        timeout: args
            .timeout
            .or(config.run.timeout_secs)
            .map(Duration::from_secs),
    };
    let offsets = offset_store(&config, &layout);
    let orchestrator = Orchestrator::new(client, layout, offsets, cancel);
    let outcome = orchestrator.run(&scope, &options).await?;

    for record in &outcome.report.channels {
        tracing::info!(
            "  {:<24} {:<8} {:>6} programmes  offset {:+}s",
            record.channel_id,
            record.status,
            record.programmes,
            record.offset_seconds
        );
    }
    tracing::info!("Report: {}", outcome.report_path.display());

    if let Some(reason) = outcome.abort_reason() {
        return Err(reason.into());
    }
    Ok(())
}

/// Runs the `channels list` subcommand.
///
/// # Errors
///
/// Returns an error if the config or catalog cannot be loaded.
#[instrument(skip_all)]
async fn run_channels_list(dir: Option<&PathBuf>) -> Result<()> {
    let config = load_config(dir)?;
    let client = build_feed_client(&config, CancellationToken::new())?;
    let catalog = load_catalog(&config, &client).await?;

    if catalog.is_empty() {
        tracing::info!("No channels found.");
        return Ok(());
    }

    for channel in catalog.channels() {
        tracing::info!("  {:<24} {}", channel.id, channel.name);
    }
    tracing::info!("Total: {} channels", catalog.len());
    Ok(())
}

/// Runs the `channels validate` subcommand.
///
/// # Errors
///
/// Returns an error if the catalog cannot be loaded or `term` does not
/// resolve to a channel.
#[instrument(skip_all)]
async fn run_channels_validate(term: &str, dir: Option<&PathBuf>) -> Result<()> {
    let config = load_config(dir)?;
    let client = build_feed_client(&config, CancellationToken::new())?;
    let catalog = load_catalog(&config, &client).await?;

    let scope = resolve_scope(
        &catalog,
        &ScopeRequest::Channel {
            term: String::from(term),
            offset: None,
        },
    )?;
    for channel in &scope.channels {
        tracing::info!("Found: {} ({}) {}", channel.id, channel.name, channel.url);
    }
    Ok(())
}

/// Runs the `stats` subcommand.
///
/// # Errors
///
/// Returns an error if the config or catalog cannot be loaded.
#[instrument(skip_all)]
async fn run_stats(dir: Option<&PathBuf>) -> Result<()> {
    let config = load_config(dir)?;
    let layout = open_layout(dir, &config)?;
    let client = build_feed_client(&config, CancellationToken::new())?;
    let catalog = load_catalog(&config, &client).await?;

    tracing::info!("Channels: {}", catalog.len());
    let prefixes = catalog.prefix_counts(STATS_PREFIX_LIMIT);
    if !prefixes.is_empty() {
        tracing::info!("Top id prefixes:");
        for (prefix, count) in &prefixes {
            tracing::info!("  {prefix:<16} {count}");
        }
    }

    let store = offset_store(&config, &layout);
    match store.load() {
        Ok(offsets) => {
            let shifted = offsets.iter().filter(|(_, seconds)| *seconds != 0).count();
            tracing::info!(
                "Offsets: {} configured, {} non-zero ({})",
                offsets.len(),
                shifted,
                store.path().display()
            );
        }
        Err(e) => tracing::warn!("Offsets: unreadable ({e})"),
    }
    Ok(())
}

/// Runs the `offsets list` subcommand.
///
/// # Errors
///
/// Returns an error if the offset store cannot be read.
#[instrument(skip_all)]
fn run_offsets_list(dir: Option<&PathBuf>) -> Result<()> {
    let config = load_config(dir)?;
    let layout = open_layout(dir, &config)?;
    let store = offset_store(&config, &layout);
    let offsets = store.load().context("failed to load offsets")?;

    if offsets.is_empty() {
        tracing::info!("No offsets configured ({}).", store.path().display());
        return Ok(());
    }

    for (channel, seconds) in offsets.iter() {
        tracing::info!("  {channel:<24} {seconds:+}s");
    }
    tracing::info!("Total: {} offsets", offsets.len());
    Ok(())
}

/// Entry point.
///
/// # Errors
///
/// Returns an error if subcommand execution fails.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    #[cfg(not(feature = "otel"))]
    {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .init();
    }

    #[cfg(feature = "otel")]
    {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

        let otel_layer = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .and_then(|_| {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .build()
                    .ok()?;

                let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                    .with_simple_exporter(exporter)
                    .build();

                let tracer = opentelemetry::trace::TracerProvider::tracer(
                    &tracer_provider,
                    env!("CARGO_PKG_NAME"),
                );
                opentelemetry::global::set_tracer_provider(tracer_provider);

                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .init();
    }

    let cli = Cli::parse();
    let dir = cli.dir.as_ref();
    match cli.command {
        Commands::Run(args) => run_pipeline(&args, dir).await,
        Commands::Channels(ch) => match ch.command {
            ChannelsSubcommands::List => run_channels_list(dir).await,
            ChannelsSubcommands::Validate { term } => run_channels_validate(&term, dir).await,
        },
        Commands::Stats => run_stats(dir).await,
        Commands::Offsets(off) => match off.command {
            OffsetsSubcommands::List => run_offsets_list(dir),
        },
    }
}
