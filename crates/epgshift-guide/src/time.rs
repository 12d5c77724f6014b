//! XMLTV timestamp codec.

use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use regex::Regex;

/// `YYYYMMDDHHMM[SS]` followed by an optional `±HHMM` zone.
#[allow(clippy::expect_used)]
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{12}|\d{14})(?:\s*([+-])(\d{2})(\d{2}))?$")
        .expect("failed to compile timestamp regex")
});

/// Output format: seconds always present, zone always explicit.
const XMLTV_FORMAT: &str = "%Y%m%d%H%M%S %z";

/// Parses an XMLTV timestamp.
///
/// Accepts 14 digits, or 12 digits with seconds implied as `00`, followed by
/// an optional `±HHMM` zone. A missing zone means UTC.
///
/// Returns `None` when the input is not a valid timestamp.
///
/// ```text
/// 20240301183000 +0100
/// 202403011830
/// ```
#[must_use]
pub fn parse_xmltv_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let caps = TIMESTAMP_RE.captures(raw.trim())?;
    let digits = caps.get(1)?.as_str();

    let naive = if digits.len() == 12 {
        NaiveDateTime::parse_from_str(&format!("{digits}00"), "%Y%m%d%H%M%S").ok()?
    } else {
        NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?
    };

    let offset = match (caps.get(2), caps.get(3), caps.get(4)) {
        (Some(sign), Some(hours), Some(minutes)) => {
            let hours: i32 = hours.as_str().parse().ok()?;
            let minutes: i32 = minutes.as_str().parse().ok()?;
            if minutes >= 60 {
                return None;
            }
            let seconds = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
            let signed = if sign.as_str() == "-" {
                seconds.checked_neg()?
            } else {
                seconds
            };
            FixedOffset::east_opt(signed)?
        }
        _ => FixedOffset::east_opt(0)?,
    };

    offset.from_local_datetime(&naive).single()
}

/// Formats a timestamp as `YYYYMMDDHHMMSS ±HHMM`, keeping its zone.
#[must_use]
pub fn format_xmltv_time(dt: &DateTime<FixedOffset>) -> String {
    dt.format(XMLTV_FORMAT).to_string()
}
