//! Splits an inclusive date range into fixed-size chunks.

use chrono::{Duration, NaiveDate};
use eventsync_ingest_models::DateChunk;

use crate::IngestError;

/// Number of days in `[from, to]`, counting both ends.
///
/// Returns 0 when `from > to`.
#[must_use]
pub fn days_in_range(from: NaiveDate, to: NaiveDate) -> u64 {
    u64::try_from((to - from).num_days() + 1).unwrap_or(0)
}

/// Splits `[from, to]` into consecutive chunks of `chunk_days` days.
///
/// The last chunk ends at `to` and may be shorter. A range shorter than
/// `chunk_days` yields a single chunk.
///
/// # Errors
///
/// Returns [`IngestError::Validation`] if `from > to` or `chunk_days` is 0.
pub fn split_range(
    from: NaiveDate,
    to: NaiveDate,
    chunk_days: u32,
) -> Result<Vec<DateChunk>, IngestError> {
    if from > to {
        return Err(IngestError::validation(format!(
            "from date {from} is after to date {to}"
        )));
    }
    if chunk_days == 0 {
        return Err(IngestError::validation("chunk_days must be at least 1"));
    }

    let step = Duration::days(i64::from(chunk_days));
    let last_offset = Duration::days(i64::from(chunk_days) - 1);

    let mut chunks = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start
            .checked_add_signed(last_offset)
            .map_or(to, |end| end.min(to));
        chunks.push(DateChunk::new(start, end));

        match start.checked_add_signed(step) {
            Some(next) => start = next,
            None => break,
        }
    }

    Ok(chunks)
}
