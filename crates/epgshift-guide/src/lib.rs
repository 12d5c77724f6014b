//! XMLTV guide handling for epgshift.
//!
//! Parses one channel's programmes out of a raw feed, shifts them by a
//! per-channel offset and renders the result back to XMLTV.

mod error;
mod model;
mod normalize;
mod parser;
mod time;
mod writer;

#[allow(clippy::module_name_repetitions)]
pub use error::{NormalizeError, ParseError};
pub use model::{
    FeedChannel, GuideDocument, Programme, RawAttribute, RejectReason, Rejection, SourceMeta,
};
pub use normalize::normalize;
pub use parser::{list_feed_channels, parse_guide};
pub use writer::render_guide;
