//! Channel catalog and channel lookup.

use std::collections::HashMap;

use anyhow::{Context, Result};
use epgshift_guide::FeedChannel;
use unicode_normalization::UnicodeNormalization;
use url::Url;

use crate::config::{AppConfig, ChannelConfig};

/// Number of suggestions offered for an unknown channel.
pub const SUGGESTION_LIMIT: usize = 5;

/// A channel the pipeline can process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Unique identifier (XMLTV `channel` attribute).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Feed URL.
    pub url: Url,
}

/// Ordered set of channels.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    channels: Vec<Channel>,
}

/// Case- and width-insensitive form used for matching.
fn fold(s: &str) -> String {
    s.nfkc().collect::<String>().to_lowercase()
}

impl Catalog {
    /// Builds the catalog from `[[channels]]`. Later duplicates of an id are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel or source URL is invalid.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut channels: Vec<Channel> = Vec::with_capacity(config.channels.len());
        for ChannelConfig { id, name, url } in &config.channels {
            if channels.iter().any(|c| c.id == *id) {
                tracing::warn!(channel = %id, "Duplicate channel in config ignored");
                continue;
            }
            let raw_url = url.as_deref().unwrap_or(&config.source.url);
            let url = Url::parse(raw_url)
                .with_context(|| format!("invalid feed URL for channel {id}: {raw_url}"))?;
            channels.push(Channel {
                id: id.clone(),
                name: name.clone().unwrap_or_else(|| id.clone()),
                url,
            });
        }
        Ok(Self { channels })
    }

    /// Builds the catalog from `<channel>` entries of a feed served at `url`.
    #[must_use]
    pub fn from_feed(feed_channels: Vec<FeedChannel>, url: &Url) -> Self {
        let mut channels: Vec<Channel> = Vec::with_capacity(feed_channels.len());
        for FeedChannel { id, display_name } in feed_channels {
            if channels.iter().any(|c| c.id == id) {
                continue;
            }
            channels.push(Channel {
                name: display_name.unwrap_or_else(|| id.clone()),
                id,
                url: url.clone(),
            });
        }
        Self { channels }
    }

    /// All channels in catalog order.
    #[must_use]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Finds a channel by exact id, exact name, partial id, then partial
    /// name. Matching ignores case and Unicode width.
    #[must_use]
    pub fn find(&self, term: &str) -> Option<&Channel> {
        let term = fold(term);
        if term.is_empty() {
            return None;
        }
        let folded: Vec<(String, String, &Channel)> = self
            .channels
            .iter()
            .map(|c| (fold(&c.id), fold(&c.name), c))
            .collect();

        folded
            .iter()
            .find(|(id, _, _)| *id == term)
            .or_else(|| folded.iter().find(|(_, name, _)| *name == term))
            .or_else(|| folded.iter().find(|(id, _, _)| id.contains(&term)))
            .or_else(|| folded.iter().find(|(_, name, _)| name.contains(&term)))
            .map(|(_, _, c)| *c)
    }

    /// Finds a channel whose id or name equals `term`, ignoring case and
    /// Unicode width.
    #[must_use]
    pub fn find_exact(&self, term: &str) -> Option<&Channel> {
        let term = fold(term);
        self.channels
            .iter()
            .find(|c| fold(&c.id) == term)
            .or_else(|| self.channels.iter().find(|c| fold(&c.name) == term))
    }

    /// Channels whose id or name contains `term`, in catalog order.
    #[must_use]
    pub fn partial_matches(&self, term: &str) -> Vec<&Channel> {
        let term = fold(term);
        if term.is_empty() {
            return Vec::new();
        }
        self.channels
            .iter()
            .filter(|c| fold(&c.id).contains(&term) || fold(&c.name).contains(&term))
            .collect()
    }

    /// Ranks channels resembling `term`, best first.
    ///
    /// Id prefix 15, id substring 10, name prefix 8, name substring 5;
    /// ties keep catalog order.
    #[must_use]
    pub fn suggest(&self, term: &str, limit: usize) -> Vec<&Channel> {
        let term = fold(term);
        if term.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(u32, &Channel)> = self
            .channels
            .iter()
            .filter_map(|c| {
                let id = fold(&c.id);
                let name = fold(&c.name);
                let score = [
                    (id.contains(&term), 10),
                    (name.contains(&term), 5),
                    (id.starts_with(&term), 15),
                    (name.starts_with(&term), 8),
                ]
                .iter()
                .filter(|(hit, _)| *hit)
                .map(|(_, points)| points)
                .sum::<u32>();
                (score > 0).then_some((score, c))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, c)| c).collect()
    }

    /// Most common id prefixes with their channel counts.
    ///
    /// The prefix is the part before the first `_`, or the first three
    /// characters for ids without one.
    #[must_use]
    pub fn prefix_counts(&self, limit: usize) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for channel in &self.channels {
            let prefix = channel.id.split_once('_').map_or_else(
                || channel.id.chars().take(3).collect(),
                |(head, _)| String::from(head),
            );
            let entry = counts.entry(prefix).or_insert(0);
            *entry = entry.saturating_add(1);
        }

        let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sorted.truncate(limit);
        sorted
    }
}
