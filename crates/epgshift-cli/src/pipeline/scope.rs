//! Run scope and offset resolution.

use epgshift_store::OffsetMap;
use serde::Serialize;

use super::catalog::{Catalog, Channel, SUGGESTION_LIMIT};

/// What the caller asked to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeRequest {
    /// Every catalog channel with its stored offset.
    All,
    /// One channel, optionally with an offset to apply and confirm.
    Channel {
        /// Channel id or name (partial matches allowed).
        term: String,
        /// Offset seconds to apply and persist on success.
        offset: Option<i64>,
    },
}

/// An offset supplied for exactly one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExplicitOffset {
    /// Canonical channel id.
    pub channel_id: String,
    /// Offset seconds.
    pub seconds: i64,
}

/// Channels to process in one run.
#[derive(Debug, Clone)]
pub struct RunScope {
    /// Channels in catalog order.
    pub channels: Vec<Channel>,
    /// Search term when a single channel was requested.
    pub requested: Option<String>,
    /// Offset to apply and confirm, if any.
    pub explicit: Option<ExplicitOffset>,
}

/// Scope resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    /// The requested channel is not in the catalog.
    #[error("channel '{term}' not found{}", format_suggestions(suggestions))]
    UnknownChannel {
        /// Search term as given.
        term: String,
        /// Closest channel ids.
        suggestions: Vec<String>,
    },
    /// An offset was given with a term matching several channels.
    #[error(
        "channel '{term}' is ambiguous ({}); name one channel to store an offset",
        candidates.join(", ")
    )]
    Ambiguous {
        /// Search term as given.
        term: String,
        /// Every matching channel id.
        candidates: Vec<String>,
    },
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {})", suggestions.join(", "))
    }
}

/// Where an applied offset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetSource {
    /// Supplied on the command line for this channel.
    Explicit,
    /// Read from the offset store.
    Stored,
    /// No entry; 0.
    Default,
}

/// Offset applied to one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOffset {
    /// Offset seconds.
    pub seconds: i64,
    /// Origin of the value.
    pub source: OffsetSource,
}

/// Resolves the offset for `channel_id`: explicit offset for exactly that
/// channel, then the stored entry, then 0.
#[must_use]
pub fn resolve_offset(
    channel_id: &str,
    explicit: Option<&ExplicitOffset>,
    stored: &OffsetMap,
) -> ResolvedOffset {
    if let Some(e) = explicit.filter(|e| e.channel_id == channel_id) {
        return ResolvedOffset {
            seconds: e.seconds,
            source: OffsetSource::Explicit,
        };
    }
    stored.get(channel_id).map_or(
        ResolvedOffset {
            seconds: 0,
            source: OffsetSource::Default,
        },
        |seconds| ResolvedOffset {
            seconds,
            source: OffsetSource::Stored,
        },
    )
}

/// Resolves a scope request against the catalog.
///
/// # Errors
///
/// Returns [`ScopeError::UnknownChannel`] with suggestions when a requested
/// channel cannot be found, and [`ScopeError::Ambiguous`] when an offset is
/// given with a partial term matching more than one channel.
pub fn resolve_scope(catalog: &Catalog, request: &ScopeRequest) -> Result<RunScope, ScopeError> {
    match request {
        ScopeRequest::All => Ok(RunScope {
            channels: catalog.channels().to_vec(),
            requested: None,
            explicit: None,
        }),
        ScopeRequest::Channel { term, offset } => {
            let Some(channel) = catalog.find(term) else {
                return Err(ScopeError::UnknownChannel {
                    term: term.clone(),
                    suggestions: catalog
                        .suggest(term, SUGGESTION_LIMIT)
                        .into_iter()
                        .map(|c| c.id.clone())
                        .collect(),
                });
            };
            if offset.is_some() && catalog.find_exact(term).is_none() {
                let candidates = catalog.partial_matches(term);
                if candidates.len() > 1 {
                    return Err(ScopeError::Ambiguous {
                        term: term.clone(),
                        candidates: candidates.into_iter().map(|c| c.id.clone()).collect(),
                    });
                }
            }
            if !channel.id.eq_ignore_ascii_case(term) {
                tracing::info!(term = %term, channel = %channel.id, "Resolved channel");
            }
            Ok(RunScope {
                explicit: offset.map(|seconds| ExplicitOffset {
                    channel_id: channel.id.clone(),
                    seconds,
                }),
                channels: vec![channel.clone()],
                requested: Some(term.clone()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use epgshift_guide::FeedChannel;
    use url::Url;

    use super::*;

    fn catalog() -> Catalog {
        let url = Url::parse("https://example.com/TV.xml").unwrap();
        Catalog::from_feed(
            ["bbc1", "bbc2", "itv"]
                .iter()
                .map(|id| FeedChannel {
                    id: String::from(*id),
                    display_name: None,
                })
                .collect(),
            &url,
        )
    }

    fn stored() -> OffsetMap {
        [(String::from("bbc1"), 30), (String::from("itv"), 0)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_explicit_offset_wins_for_its_channel() {
        // Arrange
        let explicit = ExplicitOffset {
            channel_id: String::from("bbc1"),
            seconds: -10,
        };

        // Act
        let resolved = resolve_offset("bbc1", Some(&explicit), &stored());

        // Assert
        assert_eq!(
            resolved,
            ResolvedOffset {
                seconds: -10,
                source: OffsetSource::Explicit
            }
        );
    }

    #[test]
    fn test_explicit_offset_ignored_for_other_channels() {
        // Arrange
        let explicit = ExplicitOffset {
            channel_id: String::from("bbc1"),
            seconds: -10,
        };

        // Act
        let resolved = resolve_offset("itv", Some(&explicit), &stored());

        // Assert
        assert_eq!(resolved.source, OffsetSource::Stored);
        assert_eq!(resolved.seconds, 0);
    }

    #[test]
    fn test_missing_entry_defaults_to_zero() {
        let resolved = resolve_offset("bbc2", None, &stored());
        assert_eq!(
            resolved,
            ResolvedOffset {
                seconds: 0,
                source: OffsetSource::Default
            }
        );
    }

    #[test]
    fn test_scope_all() {
        // Arrange & Act
        let scope = resolve_scope(&catalog(), &ScopeRequest::All).unwrap();

        // Assert
        assert_eq!(scope.channels.len(), 3);
        assert!(scope.explicit.is_none());
    }

    #[test]
    fn test_scope_channel_with_offset() {
        // Arrange
        let request = ScopeRequest::Channel {
            term: String::from("BBC1"),
            offset: Some(-10),
        };

        // Act
        let scope = resolve_scope(&catalog(), &request).unwrap();

        // Assert
        assert_eq!(scope.channels.len(), 1);
        assert_eq!(scope.channels[0].id, "bbc1");
        assert_eq!(
            scope.explicit,
            Some(ExplicitOffset {
                channel_id: String::from("bbc1"),
                seconds: -10
            })
        );
    }

    #[test]
    fn test_scope_channel_without_offset() {
        // Arrange
        let request = ScopeRequest::Channel {
            term: String::from("itv"),
            offset: None,
        };

        // Act
        let scope = resolve_scope(&catalog(), &request).unwrap();

        // Assert
        assert!(scope.explicit.is_none());
        assert_eq!(scope.channels[0].id, "itv");
    }

    #[test]
    fn test_scope_unknown_channel_suggests() {
        // Arrange
        let request = ScopeRequest::Channel {
            term: String::from("bbc3"),
            offset: Some(5),
        };

        // Act
        let err = resolve_scope(&catalog(), &request).unwrap_err();

        // Assert
        assert!(matches!(
            &err,
            ScopeError::UnknownChannel { suggestions, .. } if suggestions.is_empty()
        ));
        assert_eq!(err.to_string(), "channel 'bbc3' not found");
    }

    #[test]
    fn test_offset_with_ambiguous_term_is_rejected() {
        // Arrange
        let request = ScopeRequest::Channel {
            term: String::from("bbc"),
            offset: Some(-10),
        };

        // Act
        let err = resolve_scope(&catalog(), &request).unwrap_err();

        // Assert
        assert_eq!(
            err,
            ScopeError::Ambiguous {
                term: String::from("bbc"),
                candidates: vec![String::from("bbc1"), String::from("bbc2")],
            }
        );
    }

    #[test]
    fn test_offset_with_unique_partial_term_is_accepted() {
        // Arrange
        let request = ScopeRequest::Channel {
            term: String::from("it"),
            offset: Some(15),
        };

        // Act
        let scope = resolve_scope(&catalog(), &request).unwrap();

        // Assert
        assert_eq!(
            scope.explicit,
            Some(ExplicitOffset {
                channel_id: String::from("itv"),
                seconds: 15
            })
        );
    }

    #[test]
    fn test_ambiguous_term_without_offset_takes_first_match() {
        // Arrange
        let request = ScopeRequest::Channel {
            term: String::from("bbc"),
            offset: None,
        };

        // Act
        let scope = resolve_scope(&catalog(), &request).unwrap();

        // Assert
        assert_eq!(scope.channels[0].id, "bbc1");
        assert!(scope.explicit.is_none());
    }

    #[test]
    fn test_unknown_channel_message_lists_suggestions() {
        let err = ScopeError::UnknownChannel {
            term: String::from("bb"),
            suggestions: vec![String::from("bbc1"), String::from("bbc2")],
        };
        assert_eq!(
            err.to_string(),
            "channel 'bb' not found (did you mean: bbc1, bbc2)"
        );
    }
}
