//! `AppConfig` struct and TOML loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use epgshift_feed::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Combined XMLTV feed used when nothing else is configured.
const DEFAULT_SOURCE_URL: &str = "https://www.tdtchannels.com/epg/TV.xml";

/// Top-level application configuration.
#[derive(Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// Feed source settings.
    #[serde(default)]
    pub source: SourceConfig,
    /// HTTP fetch policy.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Run options.
    #[serde(default)]
    pub run: RunConfig,
    /// Data path overrides.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Channel catalog. Empty means "discover from the source feed".
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Feed source configuration.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Combined feed URL.
    #[serde(default = "default_source_url")]
    pub url: String,
    /// User-Agent override.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: default_source_url(),
            user_agent: None,
        }
    }
}

fn default_source_url() -> String {
    String::from(DEFAULT_SOURCE_URL)
}

/// Fetch retry and timeout configuration.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per feed, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on a single backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Per-request timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    /// Retry policy described by this section.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Run options.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Channels processed at the same time.
    pub concurrency: usize,
    /// Whole-run timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Also write `.xml.gz` copies of processed guides.
    pub gzip: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_secs: None,
            gzip: false,
        }
    }
}

/// Data path overrides.
#[derive(Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PathsConfig {
    /// Data directory (raw, processed, reports).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Offset file. Relative paths are resolved against the data directory.
    #[serde(default)]
    pub offsets_file: Option<PathBuf>,
}

/// A configured channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Channel identifier (the XMLTV `channel` attribute).
    pub id: String,
    /// Display name (defaults to the id).
    #[serde(default)]
    pub name: Option<String>,
    /// Feed URL (defaults to `source.url`).
    #[serde(default)]
    pub url: Option<String>,
}

impl AppConfig {
    /// Loads config from a TOML file. Returns default if file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// User-Agent sent with feed requests.
    #[must_use]
    pub fn user_agent(&self) -> String {
        self.source.user_agent.clone().unwrap_or_else(|| {
            String::from(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
        })
    }

    /// Offset file location for a data directory.
    #[must_use]
    pub fn offsets_path(&self, data_dir: &Path, default: PathBuf) -> PathBuf {
        match self.paths.offsets_file {
            Some(ref p) if p.is_absolute() => p.clone(),
            Some(ref p) => data_dir.join(p),
            None => default,
        }
    }
}
