#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Parallel fetch options, batch, progress, and result types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use eventsync_source_models::{EventRow, FetchFilters};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Default number of days per chunk.
pub const DEFAULT_CHUNK_DAYS: u32 = 7;

/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Default number of concurrent remote calls.
///
/// The export API allows 100 concurrent queries per project; 10 keeps us
/// well under that even with other clients sharing the project.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Default capacity of the worker -> writer queue, in batches.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// An inclusive sub-range of the requested date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateChunk {
    /// First day (inclusive).
    pub from: NaiveDate,
    /// Last day (inclusive).
    pub to: NaiveDate,
}

impl DateChunk {
    /// Creates a chunk covering `[from, to]`.
    #[must_use]
    pub const fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Number of days covered (inclusive on both ends).
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    /// Returns the chunk as a `(from, to)` pair.
    #[must_use]
    pub const fn as_range(&self) -> (NaiveDate, NaiveDate) {
        (self.from, self.to)
    }
}

impl fmt::Display for DateChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Outcome of fetching one chunk. Created once by a worker, consumed once
/// by the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// First day of the chunk.
    pub from: NaiveDate,
    /// Last day of the chunk.
    pub to: NaiveDate,
    /// Number of rows fetched (0 on failure).
    pub row_count: u64,
    /// Whether the chunk was fetched and transformed completely.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
    /// Transformed rows (empty on failure).
    pub rows: Vec<EventRow>,
}

impl BatchResult {
    /// A successfully fetched chunk.
    #[must_use]
    pub fn success(chunk: DateChunk, rows: Vec<EventRow>) -> Self {
        Self {
            from: chunk.from,
            to: chunk.to,
            row_count: rows.len() as u64,
            success: true,
            error: None,
            rows,
        }
    }

    /// A chunk that failed with `error`.
    #[must_use]
    pub fn failure(chunk: DateChunk, error: impl Into<String>) -> Self {
        Self {
            from: chunk.from,
            to: chunk.to,
            row_count: 0,
            success: false,
            error: Some(error.into()),
            rows: Vec::new(),
        }
    }

    /// The chunk this result belongs to.
    #[must_use]
    pub const fn chunk(&self) -> DateChunk {
        DateChunk::new(self.from, self.to)
    }
}

/// Per-item progress handed to the progress callback. Not retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// First day of the chunk.
    pub from: NaiveDate,
    /// Last day of the chunk.
    pub to: NaiveDate,
    /// 1-based position in processing order.
    pub batch_index: usize,
    /// Total number of chunks in the run.
    pub total_batches: usize,
    /// Rows written for this chunk.
    pub rows: u64,
    /// Whether the chunk was written.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
}

/// Callback invoked by the writer after each processed chunk.
pub type BatchCallback = Arc<dyn Fn(&BatchProgress) + Send + Sync>;

/// Item passed from workers to the writer.
#[derive(Debug)]
pub enum QueueItem {
    /// A finished chunk.
    Batch(BatchResult),
    /// No more batches will follow.
    Sentinel,
}

/// Lifecycle of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Chunks computed, nothing started.
    Created,
    /// Workers and writer active.
    Running,
    /// Workers joined and sentinel sent; writer finishing the queue.
    Draining,
    /// Result built.
    Complete,
}

/// What to import and where to put it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Destination table.
    pub table: String,
    /// First day (inclusive).
    pub from: NaiveDate,
    /// Last day (inclusive).
    pub to: NaiveDate,
    /// Filters forwarded to the source.
    #[serde(default)]
    pub filters: FetchFilters,
}

impl FetchRequest {
    /// Creates an unfiltered request.
    #[must_use]
    pub fn new(table: impl Into<String>, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            table: table.into(),
            from,
            to,
            filters: FetchFilters::default(),
        }
    }

    /// Sets the source filters.
    #[must_use]
    pub fn with_filters(mut self, filters: FetchFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Tuning knobs for a parallel fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelFetchOptions {
    /// Days per chunk.
    pub chunk_days: u32,
    /// Worker pool size (bounds concurrently running chunk tasks).
    pub max_workers: usize,
    /// Rate limiter size (bounds concurrent remote calls).
    pub max_concurrent: usize,
    /// Capacity of the worker -> writer queue, in batches.
    pub queue_capacity: usize,
    /// Append to an existing table instead of requiring a new one.
    pub append: bool,
}

impl Default for ParallelFetchOptions {
    fn default() -> Self {
        Self {
            chunk_days: DEFAULT_CHUNK_DAYS,
            max_workers: DEFAULT_MAX_WORKERS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            append: false,
        }
    }
}

impl ParallelFetchOptions {
    /// Sets the chunk size in days.
    #[must_use]
    pub const fn with_chunk_days(mut self, chunk_days: u32) -> Self {
        self.chunk_days = chunk_days;
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the number of concurrent remote calls.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Enables or disables append mode.
    #[must_use]
    pub const fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// Summary of a finished run. Built once, after the writer has drained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelFetchResult {
    /// Destination table.
    pub table: String,
    /// Rows from every successfully written chunk.
    pub total_rows: u64,
    /// Chunks written.
    pub successful_batches: usize,
    /// Chunks that failed to fetch or write.
    pub failed_batches: usize,
    /// One `(from, to)` range per failed chunk, ordered by start date.
    pub failed_date_ranges: Vec<(NaiveDate, NaiveDate)>,
    /// Seconds from run start to writer completion.
    pub duration_seconds: f64,
    /// When the writer finished.
    pub completed_at: DateTime<Utc>,
}

impl ParallelFetchResult {
    /// Returns `true` if any chunk failed.
    #[must_use]
    pub const fn has_failures(&self) -> bool {
        self.failed_batches > 0
    }

    /// Returns `true` if every chunk failed and nothing was written.
    #[must_use]
    pub const fn is_total_failure(&self) -> bool {
        self.has_failures() && self.total_rows == 0
    }

    /// Total number of chunks in the run.
    #[must_use]
    pub const fn total_batches(&self) -> usize {
        self.successful_batches + self.failed_batches
    }

    /// Combines this run with a run that retried exactly this run's
    /// `failed_date_ranges`.
    ///
    /// Rows and successes add up; the remaining failures are whatever the
    /// retry could not fetch.
    #[must_use]
    pub fn merge_retry(self, retry: Self) -> Self {
        Self {
            table: self.table,
            total_rows: self.total_rows + retry.total_rows,
            successful_batches: self.successful_batches + retry.successful_batches,
            failed_batches: retry.failed_batches,
            failed_date_ranges: retry.failed_date_ranges,
            duration_seconds: self.duration_seconds + retry.duration_seconds,
            completed_at: retry.completed_at,
        }
    }
}
