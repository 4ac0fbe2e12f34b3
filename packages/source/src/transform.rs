//! Raw export record to storage row transform.
//!
//! Pulls the reserved `time`, `distinct_id` and `$insert_id` properties
//! out of a [`RawEvent`] and keeps the rest as the row's `properties`.

use chrono::{DateTime, Utc};
use eventsync_source_models::{EventRow, RawEvent};
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};

use crate::SourceError;

/// Epoch values above this are treated as milliseconds rather than seconds
/// (roughly year 5138 in seconds, 1973 in milliseconds).
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Transforms a raw export record into the storage row shape.
///
/// # Errors
///
/// Returns [`SourceError::Transform`] if the event name is empty or the
/// `time` property is missing or not a valid epoch timestamp.
pub fn transform_event(raw: RawEvent) -> Result<EventRow, SourceError> {
    let RawEvent {
        event,
        mut properties,
    } = raw;

    if event.trim().is_empty() {
        return Err(SourceError::Transform {
            message: "event name is empty".to_string(),
        });
    }

    let time_value = properties
        .remove("time")
        .ok_or_else(|| SourceError::Transform {
            message: format!("event '{event}' has no time property"),
        })?;
    let event_time = parse_epoch(&time_value).ok_or_else(|| SourceError::Transform {
        message: format!("event '{event}' has invalid time {time_value}"),
    })?;

    let distinct_id = properties.remove("distinct_id").and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    let insert_id = match properties.remove("$insert_id") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => content_key(&event, event_time, distinct_id.as_deref(), &properties),
    };

    Ok(EventRow {
        insert_id,
        event_name: event,
        event_time,
        distinct_id,
        properties,
    })
}

/// Parses an epoch timestamp in seconds (integer or fractional) or
/// milliseconds.
#[must_use]
pub fn parse_epoch(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i.abs() >= MILLIS_THRESHOLD {
                    DateTime::from_timestamp_millis(i)
                } else {
                    DateTime::from_timestamp(i, 0)
                }
            } else {
                let f = n.as_f64()?;
                if !f.is_finite() {
                    return None;
                }
                #[allow(clippy::cast_possible_truncation)]
                let millis = (f * 1000.0).round() as i64;
                DateTime::from_timestamp_millis(millis)
            }
        }
        Value::String(s) => s.trim().parse::<i64>().ok().and_then(|i| {
            if i.abs() >= MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(i)
            } else {
                DateTime::from_timestamp(i, 0)
            }
        }),
        _ => None,
    }
}

/// Derives a stable content key for events the source delivered without
/// an `$insert_id`.
///
/// `serde_json::Map` iterates keys in sorted order, so identical content
/// always hashes identically.
fn content_key(
    event: &str,
    event_time: DateTime<Utc>,
    distinct_id: Option<&str>,
    properties: &Map<String, Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.as_bytes());
    hasher.update([0]);
    hasher.update(event_time.timestamp_millis().to_le_bytes());
    hasher.update([0]);
    hasher.update(distinct_id.unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(Value::Object(properties.clone()).to_string().as_bytes());
    hex::encode(&hasher.finalize()[..16])
}
