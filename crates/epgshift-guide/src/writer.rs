//! XMLTV rendering.

use quick_xml::escape::escape;

use crate::model::{GuideDocument, Programme, RawAttribute};
use crate::time::format_xmltv_time;

const DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

fn push_attribute(out: &mut String, name: &str, escaped_value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(escaped_value);
    out.push('"');
}

fn push_attributes(out: &mut String, attributes: &[RawAttribute]) {
    for attr in attributes {
        push_attribute(out, &attr.name, &attr.value);
    }
}

fn push_programme(out: &mut String, programme: &Programme) {
    out.push_str("  <programme");
    push_attribute(out, "start", &format_xmltv_time(&programme.start));
    push_attribute(out, "stop", &format_xmltv_time(&programme.stop));
    push_attribute(out, "channel", &escape(programme.channel_id.as_str()));
    push_attributes(out, &programme.attributes);
    if programme.inner_xml.is_empty() {
        out.push_str("/>\n");
    } else {
        out.push('>');
        out.push_str(&programme.inner_xml);
        out.push_str("</programme>\n");
    }
}

/// Renders a single-channel XMLTV document.
///
/// The output depends only on `doc` and `offset_seconds`: the `<tv>`
/// attributes and the channel element come from the source verbatim,
/// followed by a comment describing the shift and the programmes in source
/// order.
#[must_use]
pub fn render_guide(doc: &GuideDocument, offset_seconds: i64) -> String {
    let mut out = String::from(DECLARATION);

    out.push_str("<tv");
    push_attributes(&mut out, &doc.root_attributes);
    out.push_str(">\n");

    out.push_str(&format!(
        "  <!-- {} programmes shifted by {offset_seconds:+}s, source sha256 {} -->\n",
        doc.programmes.len(),
        doc.source.content_hash,
    ));

    if let Some(ref channel) = doc.channel_element {
        out.push_str("  ");
        out.push_str(channel);
        out.push('\n');
    }

    for programme in &doc.programmes {
        push_programme(&mut out, programme);
    }

    out.push_str("</tv>\n");
    out
}
