#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Event export source trait and the HTTP export client.
//!
//! A source implements [`EventSource`] to stream every raw event in an
//! inclusive date range. The ingest pipeline calls [`EventSource::stream`]
//! once per date chunk and transforms each record with
//! [`transform::transform_event`].

pub mod config;
pub mod export;
pub mod progress;
pub mod retry;
pub mod transform;

use async_trait::async_trait;
use chrono::NaiveDate;
use eventsync_source_models::{FetchFilters, RawEvent};
use futures::stream::BoxStream;

/// A finite, lazily produced sequence of raw events. Not restartable.
pub type EventStream<'a> = BoxStream<'a, Result<RawEvent, SourceError>>;

/// Errors that can occur during data source operations.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (file read/write).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source rejected our credentials.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Description of what went wrong.
        message: String,
    },

    /// Still rate limited after all retries.
    #[error("Rate limited after {retries} retries")]
    RateLimited {
        /// Number of retries that were attempted.
        retries: u32,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Short description (usually a body preview).
        message: String,
    },

    /// A raw record could not be transformed to the storage row shape.
    #[error("Transform error: {message}")]
    Transform {
        /// Description of what went wrong.
        message: String,
    },

    /// Source configuration is missing or invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },
}

impl SourceError {
    /// Returns `true` for failures that a later re-run of the same range
    /// may not hit again (network trouble, rate limiting, server errors).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } | Self::Io(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Json(_) | Self::Auth { .. } | Self::Transform { .. } | Self::Config { .. } => {
                false
            }
        }
    }

    /// Returns `true` if the failure is caused by invalid credentials.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Trait that all event sources must implement.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Returns a human-readable name used in log messages.
    fn name(&self) -> &str;

    /// Checks that the source is usable (credentials present and
    /// accepted) before any work is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Auth`] or [`SourceError::Config`] if the
    /// source cannot be used.
    async fn preflight(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Streams every raw event whose date falls in `[from, to]`
    /// (inclusive).
    ///
    /// The stream is finite. Errors are yielded in-band; the caller stops
    /// at the first one.
    fn stream<'a>(
        &'a self,
        from: NaiveDate,
        to: NaiveDate,
        filters: &'a FetchFilters,
    ) -> EventStream<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = SourceError::Status {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let err = SourceError::Status {
            status: 400,
            message: "bad where clause".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn auth_errors_are_fatal() {
        let err = SourceError::Auth {
            message: "invalid secret".to_string(),
        };
        assert!(err.is_auth());
        assert!(!err.is_transient());
        assert!(SourceError::RateLimited { retries: 5 }.is_transient());
    }
}
