//! Guide document model.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};

/// Attribute as written in the source, value still XML-escaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    /// Attribute name.
    pub name: String,
    /// Escaped attribute value.
    pub value: String,
}

/// Where a guide document came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMeta {
    /// When the feed was retrieved.
    pub fetched_at: DateTime<Utc>,
    /// Raw feed size in bytes.
    pub byte_len: usize,
    /// SHA-256 hex digest of the raw feed.
    pub content_hash: String,
}

/// A single validated programme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Programme {
    /// Owning channel identifier.
    pub channel_id: String,
    /// Start instant (zone preserved from the source).
    pub start: DateTime<FixedOffset>,
    /// Stop instant (zone preserved from the source).
    pub stop: DateTime<FixedOffset>,
    /// Unescaped title text.
    pub title: String,
    /// Attributes other than `start`, `stop` and `channel`, in source order.
    pub attributes: Vec<RawAttribute>,
    /// Inner XML of the `<programme>` element, verbatim.
    pub inner_xml: String,
}

impl Programme {
    /// Programme length.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.stop.signed_duration_since(self.start)
    }
}

/// Why a programme was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// No `<title>` or an empty one.
    #[error("missing title")]
    MissingTitle,
    /// `start` or `stop` attribute absent.
    #[error("missing {0} attribute")]
    MissingTimestamp(&'static str),
    /// `start` or `stop` present but unparseable.
    #[error("invalid {attribute} timestamp {value:?}")]
    InvalidTimestamp {
        /// `start` or `stop`.
        attribute: &'static str,
        /// Raw attribute value.
        value: String,
    },
    /// Child element text with an undeclared entity or broken CDATA.
    #[error("undecodable {element} text: {detail}")]
    UndecodableText {
        /// Child element name.
        element: &'static str,
        /// Decoder message.
        detail: String,
    },
    /// `start` is not strictly before `stop`.
    #[error("start is not before stop")]
    NonPositiveDuration,
}

/// A programme that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Position among the channel's `<programme>` elements (0-based).
    pub index: usize,
    /// Validation failure.
    pub reason: RejectReason,
}

/// One channel's parsed guide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideDocument {
    /// Channel identifier.
    pub channel_id: String,
    /// Attributes of the `<tv>` root element.
    pub root_attributes: Vec<RawAttribute>,
    /// The channel's own `<channel>` element, verbatim, if present.
    pub channel_element: Option<String>,
    /// Valid programmes in source order.
    pub programmes: Vec<Programme>,
    /// Programmes dropped during validation.
    pub rejected: Vec<Rejection>,
    /// Source metadata.
    pub source: SourceMeta,
}

impl GuideDocument {
    /// Whether the document holds no valid programmes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.programmes.is_empty()
    }
}

/// A `<channel>` entry discovered in a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedChannel {
    /// `id` attribute.
    pub id: String,
    /// First `<display-name>`, if any.
    pub display_name: Option<String>,
}
