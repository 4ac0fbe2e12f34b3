#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Record types shared by the export source and the local store.
//!
//! The export API produces [`RawEvent`]s. Every raw event is transformed
//! into an [`EventRow`], the flat shape stored in the local `DuckDB`
//! tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single event exactly as delivered by the export API.
///
/// The export format is one JSON object per line:
///
/// ```json
/// {"event": "Signup", "properties": {"time": 1704067200, "distinct_id": "u1"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name.
    pub event: String,
    /// All event properties, including the reserved `time`,
    /// `distinct_id` and `$insert_id` keys.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl RawEvent {
    /// Creates a raw event from a name and a property map.
    #[must_use]
    pub fn new(event: impl Into<String>, properties: Map<String, Value>) -> Self {
        Self {
            event: event.into(),
            properties,
        }
    }
}

/// An event transformed to the storage row shape.
///
/// `insert_id` is the stable content key the local store uses to
/// de-duplicate rows, so re-importing an overlapping range never
/// produces duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    /// Unique, stable identifier for this event.
    pub insert_id: String,
    /// Event name.
    pub event_name: String,
    /// When the event happened.
    pub event_time: DateTime<Utc>,
    /// Identifier of the user that produced the event, if any.
    pub distinct_id: Option<String>,
    /// Remaining (non-reserved) properties.
    pub properties: Map<String, Value>,
}

/// Filters forwarded verbatim to the export API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFilters {
    /// Only export events with these names. Empty means all events.
    #[serde(default)]
    pub events: Vec<String>,
    /// Source-side filter expression.
    pub where_clause: Option<String>,
}

impl FetchFilters {
    /// Restricts the export to the given event names.
    #[must_use]
    pub fn with_events(mut self, events: Vec<String>) -> Self {
        self.events = events;
        self
    }

    /// Sets the source-side filter expression.
    #[must_use]
    pub fn with_where(mut self, expression: impl Into<String>) -> Self {
        self.where_clause = Some(expression.into());
        self
    }
}
