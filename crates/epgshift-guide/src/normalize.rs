//! Per-channel clock skew correction.

use chrono::{DateTime, FixedOffset, TimeDelta};
use tracing::instrument;

use crate::error::NormalizeError;
use crate::model::{GuideDocument, Programme};

fn shift(
    dt: DateTime<FixedOffset>,
    delta: TimeDelta,
    err: impl Fn() -> NormalizeError,
) -> Result<DateTime<FixedOffset>, NormalizeError> {
    dt.checked_add_signed(delta).ok_or_else(err)
}

/// Shifts every programme of `doc` by `offset_seconds`.
///
/// Positive offsets move programmes later, negative ones earlier. Each
/// timestamp keeps its zone and each programme keeps its exact duration.
/// Rejected programmes and source metadata are carried over untouched.
///
/// # Errors
///
/// Returns [`NormalizeError::OutOfRange`] when the offset or a shifted
/// timestamp cannot be represented.
#[instrument(skip_all, fields(channel = %doc.channel_id, offset = offset_seconds))]
pub fn normalize(doc: GuideDocument, offset_seconds: i64) -> Result<GuideDocument, NormalizeError> {
    if offset_seconds == 0 {
        return Ok(doc);
    }

    let out_of_range = || NormalizeError::OutOfRange {
        channel: doc.channel_id.clone(),
        offset_seconds,
    };

    let delta = TimeDelta::try_seconds(offset_seconds).ok_or_else(out_of_range)?;

    let programmes = doc
        .programmes
        .iter()
        .map(|p| {
            Ok(Programme {
                start: shift(p.start, delta, out_of_range)?,
                stop: shift(p.stop, delta, out_of_range)?,
                ..p.clone()
            })
        })
        .collect::<Result<Vec<_>, NormalizeError>>()?;

    tracing::debug!(programmes = programmes.len(), "Programmes shifted");

    Ok(GuideDocument { programmes, ..doc })
}
