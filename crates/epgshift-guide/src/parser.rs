//! XMLTV reader.
//!
//! Walks the children of the `<tv>` root with the `quick-xml` event reader
//! and slices every child element straight out of the input, so elements the
//! pipeline does not interpret are carried to the output byte for byte.

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset};
use quick_xml::Reader;
use quick_xml::escape::unescape;
use quick_xml::events::{BytesStart, Event};
use tracing::instrument;

use crate::error::ParseError;
use crate::model::{
    FeedChannel, GuideDocument, Programme, RawAttribute, RejectReason, Rejection, SourceMeta,
};
use crate::time::parse_xmltv_time;

/// Name of the XMLTV root element.
const ROOT: &[u8] = b"tv";

/// A direct child of the root element.
#[derive(Debug)]
struct Element<'a> {
    name: String,
    attributes: Vec<RawAttribute>,
    /// Whole element including its tags.
    outer: &'a str,
    /// Content between the tags (empty for `<x/>`).
    inner: &'a str,
}

fn malformed(position: u64, err: &impl std::fmt::Display) -> ParseError {
    ParseError::Malformed {
        position,
        message: err.to_string(),
    }
}

fn slice(text: &str, start: u64, end: u64) -> Result<&str, ParseError> {
    let range = usize::try_from(start)
        .ok()
        .zip(usize::try_from(end).ok())
        .and_then(|(s, e)| text.get(s..e));
    range.ok_or_else(|| malformed(start, &"element span outside input"))
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn raw_attributes(e: &BytesStart<'_>, position: u64) -> Result<Vec<RawAttribute>, ParseError> {
    e.attributes()
        .map(|attr| {
            let attr = attr.map_err(|err| malformed(position, &err))?;
            let name = std::str::from_utf8(attr.key.as_ref())
                .map_err(|err| malformed(position, &err))?;
            let value =
                std::str::from_utf8(&attr.value).map_err(|err| malformed(position, &err))?;
            Ok(RawAttribute {
                name: String::from(name),
                value: String::from(value),
            })
        })
        .collect()
}

fn attribute<'b>(attributes: &'b [RawAttribute], name: &str) -> Option<&'b str> {
    attributes
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.value.as_str())
}

fn unescaped_attribute<'b>(attributes: &'b [RawAttribute], name: &str) -> Option<Cow<'b, str>> {
    attribute(attributes, name).and_then(|v| unescape(v).ok())
}

/// Visits every direct child of `<tv>` and returns the root attributes.
fn scan_document<'a>(
    text: &'a str,
    mut visit: impl FnMut(Element<'a>),
) -> Result<Vec<RawAttribute>, ParseError> {
    let mut reader = Reader::from_str(text);
    let mut root: Option<Vec<RawAttribute>> = None;
    let mut closed = false;

    loop {
        let event_start = reader.buffer_position();
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(err) => return Err(malformed(reader.error_position(), &err)),
        };

        match event {
            Event::Start(e) | Event::Empty(e) if root.is_none() && e.name().as_ref() != ROOT => {
                return Err(ParseError::UnexpectedRoot {
                    found: element_name(&e),
                });
            }
            Event::Start(e) if root.is_none() => {
                root = Some(raw_attributes(&e, event_start)?);
            }
            Event::Empty(e) if root.is_none() => {
                root = Some(raw_attributes(&e, event_start)?);
                closed = true;
            }
            Event::Start(e) | Event::Empty(e) if closed => {
                return Err(malformed(
                    event_start,
                    &format!("unexpected element <{}> after root", element_name(&e)),
                ));
            }
            Event::Start(e) => {
                let span = match reader.read_to_end(e.name()) {
                    Ok(span) => span,
                    Err(err) => return Err(malformed(reader.error_position(), &err)),
                };
                visit(Element {
                    name: element_name(&e),
                    attributes: raw_attributes(&e, event_start)?,
                    outer: slice(text, event_start, reader.buffer_position())?,
                    inner: slice(text, span.start, span.end)?,
                });
            }
            Event::Empty(e) => {
                visit(Element {
                    name: element_name(&e),
                    attributes: raw_attributes(&e, event_start)?,
                    outer: slice(text, event_start, reader.buffer_position())?,
                    inner: "",
                });
            }
            // Children are consumed by `read_to_end`, so this closes the root.
            Event::End(_) => closed = true,
            Event::Eof => break,
            _ => {}
        }
    }

    match (root, closed) {
        (None, _) => Err(ParseError::MissingRoot),
        (Some(_), false) => Err(ParseError::Truncated),
        (Some(attributes), true) => Ok(attributes),
    }
}

/// Decodes character data, honouring CDATA sections.
fn text_content(raw: &str) -> Result<String, String> {
    const UNTERMINATED: &str = "unterminated CDATA section";

    let mut out = String::new();
    let mut rest = raw;
    while let Some(open) = rest.find("<![CDATA[") {
        let (before, after) = rest.split_at(open);
        out.push_str(&unescape(before).map_err(|e| e.to_string())?);
        let after = after.strip_prefix("<![CDATA[").ok_or(UNTERMINATED)?;
        let close = after.find("]]>").ok_or(UNTERMINATED)?;
        let (cdata, tail) = after.split_at(close);
        out.push_str(cdata);
        rest = tail.strip_prefix("]]>").ok_or(UNTERMINATED)?;
    }
    out.push_str(&unescape(rest).map_err(|e| e.to_string())?);
    Ok(out)
}

/// Trimmed text of the first `<name>` child within `inner`.
///
/// `None` when there is no such child; `Some(Err(_))` when its text cannot
/// be decoded.
fn first_child_text(inner: &str, name: &[u8]) -> Option<Result<String, String>> {
    let mut reader = Reader::from_str(inner);
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.name().as_ref() == name => {
                let span = reader.read_to_end(e.name()).ok()?;
                let start = usize::try_from(span.start).ok()?;
                let end = usize::try_from(span.end).ok()?;
                let raw = inner.get(start..end)?;
                return Some(text_content(raw).map(|t| String::from(t.trim())));
            }
            Event::Empty(e) if e.name().as_ref() == name => return Some(Ok(String::new())),
            Event::Start(e) => {
                reader.read_to_end(e.name()).ok()?;
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

fn timestamp(
    attributes: &[RawAttribute],
    name: &'static str,
) -> Result<DateTime<FixedOffset>, RejectReason> {
    let raw = attribute(attributes, name).ok_or(RejectReason::MissingTimestamp(name))?;
    parse_xmltv_time(raw).ok_or_else(|| RejectReason::InvalidTimestamp {
        attribute: name,
        value: String::from(raw),
    })
}

fn validate_programme(channel_id: &str, element: &Element<'_>) -> Result<Programme, RejectReason> {
    let title = first_child_text(element.inner, b"title")
        .transpose()
        .map_err(|detail| RejectReason::UndecodableText {
            element: "title",
            detail,
        })?
        .filter(|t| !t.is_empty())
        .ok_or(RejectReason::MissingTitle)?;
    let start = timestamp(&element.attributes, "start")?;
    let stop = timestamp(&element.attributes, "stop")?;
    if start >= stop {
        return Err(RejectReason::NonPositiveDuration);
    }

    let attributes = element
        .attributes
        .iter()
        .filter(|a| !matches!(a.name.as_str(), "start" | "stop" | "channel"))
        .cloned()
        .collect();

    Ok(Programme {
        channel_id: String::from(channel_id),
        start,
        stop,
        title,
        attributes,
        inner_xml: String::from(element.inner),
    })
}

fn decode(raw: &[u8]) -> Result<&str, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|e| ParseError::Encoding {
        valid_up_to: e.valid_up_to(),
    })?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Parses one channel's programmes out of a raw XMLTV feed.
///
/// Programmes are selected by their `channel` attribute, so a combined
/// feed carrying many channels can be parsed once per channel. Programmes
/// that fail validation (missing title, unparseable timestamps,
/// `start >= stop`) are recorded in [`GuideDocument::rejected`] instead of
/// failing the whole document.
///
/// # Errors
///
/// Returns [`ParseError`] when the input is not UTF-8, is not well-formed
/// XML, has no `<tv>` root, or ends before the root is closed.
#[instrument(skip_all, fields(channel = channel_id, bytes = raw.len()))]
pub fn parse_guide(
    raw: &[u8],
    channel_id: &str,
    source: SourceMeta,
) -> Result<GuideDocument, ParseError> {
    let text = decode(raw)?;

    let mut channel_element: Option<String> = None;
    let mut programmes = Vec::new();
    let mut rejected = Vec::new();
    let mut index: usize = 0;

    let root_attributes = scan_document(text, |element| match element.name.as_str() {
        "channel" if channel_element.is_none() => {
            if unescaped_attribute(&element.attributes, "id").as_deref() == Some(channel_id) {
                channel_element = Some(String::from(element.outer));
            }
        }
        "programme" => {
            if unescaped_attribute(&element.attributes, "channel").as_deref() != Some(channel_id)
            {
                return;
            }
            match validate_programme(channel_id, &element) {
                Ok(programme) => programmes.push(programme),
                Err(reason) => {
                    tracing::debug!(index, %reason, "Programme rejected");
                    rejected.push(Rejection { index, reason });
                }
            }
            index = index.saturating_add(1);
        }
        _ => {}
    })?;

    tracing::debug!(
        programmes = programmes.len(),
        rejected = rejected.len(),
        has_channel_element = channel_element.is_some(),
        "Guide parsed"
    );

    Ok(GuideDocument {
        channel_id: String::from(channel_id),
        root_attributes,
        channel_element,
        programmes,
        rejected,
        source,
    })
}

/// Lists the `<channel>` entries declared in a raw XMLTV feed.
///
/// # Errors
///
/// Returns [`ParseError`] under the same conditions as [`parse_guide`].
pub fn list_feed_channels(raw: &[u8]) -> Result<Vec<FeedChannel>, ParseError> {
    let text = decode(raw)?;
    let mut channels = Vec::new();

    scan_document(text, |element| {
        if element.name != "channel" {
            return;
        }
        if let Some(id) = unescaped_attribute(&element.attributes, "id") {
            channels.push(FeedChannel {
                id: id.into_owned(),
                display_name: first_child_text(element.inner, b"display-name")
                    .and_then(Result::ok)
                    .filter(|n| !n.is_empty()),
            });
        }
    })?;

    Ok(channels)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use chrono::Utc;

    use super::*;

    const COMBINED: &str = include_str!("../../../fixtures/xmltv/combined.xml");

    fn source(raw: &[u8]) -> SourceMeta {
        SourceMeta {
            fetched_at: Utc::now(),
            byte_len: raw.len(),
            content_hash: String::from("0000"),
        }
    }

    fn parse(raw: &str, channel: &str) -> Result<GuideDocument, ParseError> {
        parse_guide(raw.as_bytes(), channel, source(raw.as_bytes()))
    }

    #[test]
    fn test_parse_selects_channel_programmes() {
        // Arrange & Act
        let doc = parse(COMBINED, "bbc1").unwrap();

        // Assert
        assert_eq!(doc.channel_id, "bbc1");
        assert_eq!(doc.programmes.len(), 3);
        assert!(doc.programmes.iter().all(|p| p.channel_id == "bbc1"));
        assert_eq!(doc.programmes[0].title, "Breakfast");
        assert_eq!(doc.programmes[1].title, "Homes & Gardens");
        assert!(doc.rejected.is_empty());
    }

    #[test]
    fn test_parse_keeps_channel_element_and_root_attributes() {
        // Arrange & Act
        let doc = parse(COMBINED, "itv").unwrap();

        // Assert
        let channel = doc.channel_element.unwrap();
        assert!(channel.starts_with("<channel id=\"itv\">"));
        assert!(channel.ends_with("</channel>"));
        assert!(channel.contains("<display-name>ITV1</display-name>"));
        assert_eq!(
            doc.root_attributes,
            vec![RawAttribute {
                name: String::from("generator-info-name"),
                value: String::from("fixture"),
            }]
        );
    }

    #[test]
    fn test_parse_preserves_opaque_metadata() {
        // Arrange & Act
        let doc = parse(COMBINED, "bbc1").unwrap();

        // Assert
        let first = &doc.programmes[0];
        assert!(first.inner_xml.contains("<category lang=\"en\">News</category>"));
        assert!(first.inner_xml.contains("<desc>Morning news &amp; weather.</desc>"));
        assert_eq!(
            first.attributes,
            vec![RawAttribute {
                name: String::from("clumpidx"),
                value: String::from("0/1"),
            }]
        );
    }

    #[test]
    fn test_parse_rejects_invalid_programmes() {
        // Arrange & Act
        let doc = parse(COMBINED, "itv").unwrap();

        // Assert
        assert_eq!(doc.programmes.len(), 1);
        assert_eq!(doc.rejected.len(), 3);
        assert_eq!(doc.rejected[0].index, 1);
        assert_eq!(doc.rejected[0].reason, RejectReason::MissingTitle);
        assert_eq!(
            doc.rejected[1].reason,
            RejectReason::InvalidTimestamp {
                attribute: "start",
                value: String::from("yesterday"),
            }
        );
        assert_eq!(doc.rejected[2].reason, RejectReason::NonPositiveDuration);
    }

    #[test]
    fn test_parse_undeclared_entity_in_title_is_rejected_as_undecodable() {
        // Arrange
        let xml = r#"<tv><programme start="20240301060000 +0000" stop="20240301070000 +0000" channel="a"><title>Caf&eacute; Culture</title></programme></tv>"#;

        // Act
        let doc = parse(xml, "a").unwrap();

        // Assert
        assert!(doc.programmes.is_empty());
        assert!(matches!(
            &doc.rejected[0].reason,
            RejectReason::UndecodableText { element: "title", detail } if !detail.is_empty()
        ));
    }

    #[test]
    fn test_parse_missing_stop_is_rejected() {
        // Arrange
        let xml = r#"<tv><programme start="20240301060000 +0000" channel="a"><title>T</title></programme></tv>"#;

        // Act
        let doc = parse(xml, "a").unwrap();

        // Assert
        assert!(doc.programmes.is_empty());
        assert_eq!(doc.rejected[0].reason, RejectReason::MissingTimestamp("stop"));
    }

    #[test]
    fn test_parse_unknown_channel_is_empty() {
        // Arrange & Act
        let doc = parse(COMBINED, "nope").unwrap();

        // Assert
        assert!(doc.is_empty());
        assert!(doc.channel_element.is_none());
    }

    #[test]
    fn test_parse_cdata_title() {
        // Arrange
        let xml = r#"<tv><programme start="20240301060000" stop="20240301070000" channel="a"><title><![CDATA[Tom & Jerry]]></title></programme></tv>"#;

        // Act
        let doc = parse(xml, "a").unwrap();

        // Assert
        assert_eq!(doc.programmes[0].title, "Tom & Jerry");
    }

    #[test]
    fn test_parse_self_closing_root_is_empty() {
        let doc = parse(r#"<?xml version="1.0"?><tv/>"#, "a").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_parse_malformed_xml() {
        // Arrange
        let xml = "<tv><programme start=\"x\" channel=\"a\"><title>T</titel></programme></tv>";

        // Act
        let err = parse(xml, "a").unwrap_err();

        // Assert
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn test_parse_truncated_document() {
        // Arrange
        let xml = r#"<tv><programme start="20240301060000" stop="20240301070000" channel="a"><title>T</title></programme>"#;

        // Act
        let result = parse(xml, "a");

        // Assert
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_foreign_root() {
        // Arrange & Act
        let err = parse("<rss><channel/></rss>", "a").unwrap_err();

        // Assert
        assert_eq!(
            err,
            ParseError::UnexpectedRoot {
                found: String::from("rss")
            }
        );
    }

    #[test]
    fn test_parse_empty_input_has_no_root() {
        let err = parse("  \n", "a").unwrap_err();
        assert_eq!(err, ParseError::MissingRoot);
    }

    #[test]
    fn test_parse_non_utf8() {
        // Arrange
        let raw = b"<tv>\xff\xfe</tv>";

        // Act
        let err = parse_guide(raw, "a", source(raw)).unwrap_err();

        // Assert
        assert_eq!(err, ParseError::Encoding { valid_up_to: 4 });
    }

    #[test]
    fn test_list_feed_channels() {
        // Arrange & Act
        let channels = list_feed_channels(COMBINED.as_bytes()).unwrap();

        // Assert
        let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["bbc1", "itv", "c4"]);
        assert_eq!(channels[0].display_name.as_deref(), Some("BBC One"));
        assert_eq!(channels[2].display_name, None);
    }
}
