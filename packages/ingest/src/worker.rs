//! Fetches one date chunk and turns it into a [`BatchResult`].

use std::sync::atomic::{AtomicU64, Ordering};

use eventsync_ingest_models::{BatchResult, DateChunk};
use eventsync_source::transform::transform_event;
use eventsync_source::{EventSource, SourceError};
use eventsync_source_models::{EventRow, FetchFilters};
use futures::StreamExt as _;

use crate::rate_limit::RateLimiter;

/// Fetches and transforms every event in `chunk` while holding a rate
/// limiter permit.
///
/// Never fails: a retrieval or transform error produces a failed
/// [`BatchResult`] carrying the error message, labelled `transient` when a
/// later retry of the range may succeed and `permanent` otherwise.
pub async fn fetch_chunk(
    source: &dyn EventSource,
    chunk: DateChunk,
    filters: &FetchFilters,
    limiter: &RateLimiter,
    rows_fetched: &AtomicU64,
) -> BatchResult {
    let fetched = match limiter.run(collect_rows(source, chunk, filters)).await {
        Ok(fetched) => fetched,
        Err(e) => {
            return BatchResult::failure(chunk, format!("rate limiter closed: {e}"));
        }
    };

    match fetched {
        Ok(rows) => {
            rows_fetched.fetch_add(rows.len() as u64, Ordering::Relaxed);
            log::debug!("[{}] {chunk}: fetched {} rows", source.name(), rows.len());
            BatchResult::success(chunk, rows)
        }
        Err(e) => {
            let message = failure_message(&e);
            if e.is_transient() {
                log::warn!("[{}] {chunk}: fetch failed: {message}", source.name());
            } else {
                log::error!("[{}] {chunk}: fetch failed: {message}", source.name());
            }
            BatchResult::failure(chunk, message)
        }
    }
}

fn failure_message(e: &SourceError) -> String {
    let kind = if e.is_transient() {
        "transient"
    } else {
        "permanent"
    };
    format!("{e} ({kind})")
}

async fn collect_rows(
    source: &dyn EventSource,
    chunk: DateChunk,
    filters: &FetchFilters,
) -> Result<Vec<EventRow>, SourceError> {
    let mut stream = source.stream(chunk.from, chunk.to, filters);
    let mut rows = Vec::new();

    while let Some(raw) = stream.next().await {
        rows.push(transform_event(raw?)?);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::test_support::StubSource;

    fn chunk(from: &str, to: &str) -> DateChunk {
        DateChunk::new(
            NaiveDate::parse_from_str(from, "%Y-%m-%d").unwrap(),
            NaiveDate::parse_from_str(to, "%Y-%m-%d").unwrap(),
        )
    }

    #[tokio::test]
    async fn collects_every_event_in_range() {
        let source = StubSource::new(3);
        let limiter = RateLimiter::new(1).unwrap();
        let counter = AtomicU64::new(0);

        let result = fetch_chunk(
            &source,
            chunk("2024-01-01", "2024-01-07"),
            &FetchFilters::default(),
            &limiter,
            &counter,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.row_count, 21);
        assert_eq!(result.rows.len(), 21);
        assert_eq!(counter.load(Ordering::Relaxed), 21);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn failure_becomes_failed_batch() {
        let source = StubSource::new(3).fail_range("2024-01-15", "2024-01-21");
        let limiter = RateLimiter::new(1).unwrap();
        let counter = AtomicU64::new(0);

        let result = fetch_chunk(
            &source,
            chunk("2024-01-15", "2024-01-21"),
            &FetchFilters::default(),
            &limiter,
            &counter,
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.row_count, 0);
        assert!(result.rows.is_empty());
        let error = result.error.unwrap();
        assert!(error.contains("503"));
        assert!(error.ends_with("(transient)"), "{error}");
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn transform_error_fails_the_chunk() {
        let source = StubSource::new(2).without_time();
        let limiter = RateLimiter::new(1).unwrap();

        let result = fetch_chunk(
            &source,
            chunk("2024-01-01", "2024-01-01"),
            &FetchFilters::default(),
            &limiter,
            &AtomicU64::new(0),
        )
        .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("Transform error"));
        assert!(error.ends_with("(permanent)"), "{error}");
    }

    #[test]
    fn failure_messages_are_labelled_by_kind() {
        let rejected = SourceError::Status {
            status: 400,
            message: "bad where clause".to_string(),
        };
        assert_eq!(
            failure_message(&rejected),
            "HTTP 400: bad where clause (permanent)"
        );
        assert!(failure_message(&SourceError::RateLimited { retries: 5 }).ends_with("(transient)"));
    }
}
