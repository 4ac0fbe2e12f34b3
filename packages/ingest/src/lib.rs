#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Parallel, chunked import of remote events into a local table.
//!
//! [`parallel_fetch`] splits the requested date range into chunks, fetches
//! them on a bounded pool of tokio tasks (with a separate cap on in-flight
//! remote calls), and funnels every finished chunk through a bounded queue
//! to a single writer thread that owns the sink. Per-chunk failures are
//! isolated and reported in the result so the caller can retry exactly the
//! failed ranges with [`retry_failed_ranges`].

pub mod queue;
pub mod rate_limit;
pub mod split;
pub mod worker;
pub mod writer;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use eventsync_database::{DbError, EventSink, validate_table_name};
use eventsync_ingest_models::{
    BatchCallback, BatchResult, DateChunk, FetchRequest, ParallelFetchOptions,
    ParallelFetchResult, QueueItem, RunState,
};
use eventsync_source::{EventSource, SourceError};
use eventsync_source_models::FetchFilters;
use futures::{StreamExt as _, stream};

use crate::rate_limit::RateLimiter;
use crate::split::{days_in_range, split_range};
use crate::writer::WriterLoop;

/// Errors that stop a run before (or instead of) producing a result.
///
/// Individual chunk failures are never reported here; they end up in
/// [`ParallelFetchResult::failed_date_ranges`].
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The request or options are unusable.
    #[error("Invalid request: {message}")]
    Validation {
        /// Description of what went wrong.
        message: String,
    },

    /// The destination table exists and append mode is off.
    #[error("Table '{table}' already exists (use append mode to add to it)")]
    TableExists {
        /// Table name.
        table: String,
    },

    /// The source rejected our credentials during pre-flight.
    #[error("Source authentication failed: {0}")]
    Auth(#[source] SourceError),

    /// The source could not be used.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The local store could not be inspected.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The writer thread died.
    #[error("Writer stopped unexpectedly: {message}")]
    Writer {
        /// Description of what went wrong.
        message: String,
    },

    /// The writer side of the batch queue is gone.
    #[error("Batch queue closed")]
    QueueClosed,
}

impl IngestError {
    /// Builds an [`IngestError::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Imports every event in `request` into `request.table`.
///
/// Validates the request, checks credentials and the destination table,
/// then runs the pipeline to completion. The sink is moved onto the writer
/// thread for the duration of the run and returned with the result.
///
/// A partially failed run still returns `Ok`; inspect
/// [`ParallelFetchResult::has_failures`].
///
/// # Errors
///
/// * [`IngestError::Validation`] for an invalid range, options or table
///   name
/// * [`IngestError::Auth`] if the source rejects the credentials
/// * [`IngestError::TableExists`] if the table exists and append mode is off
/// * [`IngestError::Database`] if the sink cannot be inspected
///
/// All of these are raised before any chunk is fetched.
pub async fn parallel_fetch<S>(
    source: Arc<dyn EventSource>,
    sink: S,
    request: &FetchRequest,
    options: &ParallelFetchOptions,
    on_batch_complete: Option<BatchCallback>,
) -> Result<(ParallelFetchResult, S), IngestError>
where
    S: EventSink + 'static,
{
    validate_options(options)?;
    validate_table_name(&request.table).map_err(|e| IngestError::validation(e.to_string()))?;
    let chunks = split_range(request.from, request.to, options.chunk_days)?;

    preflight(source.as_ref()).await?;

    let table_exists = sink.table_exists(&request.table)?;
    if table_exists && !options.append {
        return Err(IngestError::TableExists {
            table: request.table.clone(),
        });
    }

    log::info!(
        "[pipeline] {}: fetching {} ({} days) from {} in {} chunks of {} days, {} workers, {} concurrent calls",
        request.table,
        DateChunk::new(request.from, request.to),
        days_in_range(request.from, request.to),
        source.name(),
        chunks.len(),
        options.chunk_days,
        options.max_workers,
        options.max_concurrent,
    );

    let run = Pipeline {
        source,
        sink,
        table: request.table.clone(),
        filters: request.filters.clone(),
        options: *options,
        table_exists,
        on_batch_complete,
    }
    .run(chunks)
    .await?;

    Ok((run.result, run.sink))
}

/// Re-runs exactly the failed ranges of `previous` in append mode and
/// merges the outcome into it.
///
/// Each failed range becomes one chunk. Rows already stored under the same
/// `insert_id` are skipped by the sink, so retrying a range that partially
/// reached the table does not duplicate events.
///
/// Returns `previous` unchanged when it has no failures.
///
/// # Errors
///
/// Same pre-flight errors as [`parallel_fetch`] except
/// [`IngestError::TableExists`].
pub async fn retry_failed_ranges<S>(
    source: Arc<dyn EventSource>,
    sink: S,
    previous: &ParallelFetchResult,
    filters: &FetchFilters,
    options: &ParallelFetchOptions,
    on_batch_complete: Option<BatchCallback>,
) -> Result<(ParallelFetchResult, S), IngestError>
where
    S: EventSink + 'static,
{
    if !previous.has_failures() {
        return Ok((previous.clone(), sink));
    }

    validate_options(options)?;
    preflight(source.as_ref()).await?;

    let chunks: Vec<DateChunk> = previous
        .failed_date_ranges
        .iter()
        .map(|&(from, to)| DateChunk::new(from, to))
        .collect();
    let table_exists = sink.table_exists(&previous.table)?;

    log::info!(
        "[pipeline] {}: retrying {} failed ranges",
        previous.table,
        chunks.len()
    );

    let run = Pipeline {
        source,
        sink,
        table: previous.table.clone(),
        filters: filters.clone(),
        options: options.with_append(true),
        table_exists,
        on_batch_complete,
    }
    .run(chunks)
    .await?;

    Ok((previous.clone().merge_retry(run.result), run.sink))
}

/// Options that fetch `request` as one chunk on one worker.
///
/// Used for non-parallel runs so both modes share the same pipeline.
#[must_use]
pub fn single_chunk_options(
    request: &FetchRequest,
    options: &ParallelFetchOptions,
) -> ParallelFetchOptions {
    let days = days_in_range(request.from, request.to).max(1);
    options
        .with_max_workers(1)
        .with_chunk_days(u32::try_from(days).unwrap_or(u32::MAX))
}

fn validate_options(options: &ParallelFetchOptions) -> Result<(), IngestError> {
    if options.chunk_days == 0 {
        return Err(IngestError::validation("chunk_days must be at least 1"));
    }
    if options.max_workers == 0 {
        return Err(IngestError::validation("max_workers must be at least 1"));
    }
    if options.max_concurrent == 0 {
        return Err(IngestError::validation("max_concurrent must be at least 1"));
    }
    if options.queue_capacity == 0 {
        return Err(IngestError::validation("queue_capacity must be at least 1"));
    }
    Ok(())
}

async fn preflight(source: &dyn EventSource) -> Result<(), IngestError> {
    source.preflight().await.map_err(|e| {
        if e.is_auth() {
            IngestError::Auth(e)
        } else {
            IngestError::Source(e)
        }
    })
}

fn log_state(table: &str, state: RunState) {
    log::info!("[pipeline] {table}: {state}");
}

/// One run over a fixed set of chunks.
struct Pipeline<S> {
    source: Arc<dyn EventSource>,
    sink: S,
    table: String,
    filters: FetchFilters,
    options: ParallelFetchOptions,
    table_exists: bool,
    on_batch_complete: Option<BatchCallback>,
}

struct PipelineOutcome<S> {
    result: ParallelFetchResult,
    sink: S,
    #[cfg_attr(not(test), allow(dead_code))]
    queue_high_water: usize,
}

impl<S: EventSink + 'static> Pipeline<S> {
    async fn run(self, chunks: Vec<DateChunk>) -> Result<PipelineOutcome<S>, IngestError> {
        let Self {
            source,
            sink,
            table,
            filters,
            options,
            table_exists,
            on_batch_complete,
        } = self;

        let (Some(span_from), Some(span_to)) = (
            chunks.iter().map(|c| c.from).min(),
            chunks.iter().map(|c| c.to).max(),
        ) else {
            return Err(IngestError::validation("nothing to fetch"));
        };

        let started = Instant::now();
        let total_batches = chunks.len();
        log_state(&table, RunState::Created);

        let limiter = RateLimiter::new(options.max_concurrent)?;
        let (queue, rx) = queue::bounded(options.queue_capacity)?;
        let rows_fetched = Arc::new(AtomicU64::new(0));
        let filters = Arc::new(filters);

        let writer = WriterLoop::new(
            sink,
            table.clone(),
            table_exists,
            DateChunk::new(span_from, span_to),
            total_batches,
            on_batch_complete,
        );
        let writer_handle = tokio::task::spawn_blocking(move || writer.run(rx));
        log_state(&table, RunState::Running);

        let mut workers = stream::iter(chunks)
            .map(|chunk| {
                let source = Arc::clone(&source);
                let filters = Arc::clone(&filters);
                let limiter = limiter.clone();
                let queue = queue.clone();
                let rows_fetched = Arc::clone(&rows_fetched);

                let handle = tokio::spawn(async move {
                    let batch = worker::fetch_chunk(
                        source.as_ref(),
                        chunk,
                        &filters,
                        &limiter,
                        &rows_fetched,
                    )
                    .await;
                    queue.push(QueueItem::Batch(batch)).await
                });

                async move { (chunk, handle.await) }
            })
            .buffer_unordered(options.max_workers);

        while let Some((chunk, joined)) = workers.next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("[pipeline] {table}: batch {chunk} was not delivered: {e}");
                }
                Err(e) => {
                    log::error!("[pipeline] {table}: worker for {chunk} failed: {e}");
                    let batch = BatchResult::failure(chunk, format!("worker task failed: {e}"));
                    if let Err(e) = queue.push(QueueItem::Batch(batch)).await {
                        log::error!("[pipeline] {table}: batch {chunk} was not delivered: {e}");
                    }
                }
            }
        }
        drop(workers);

        log_state(&table, RunState::Draining);
        log::debug!(
            "[pipeline] {table}: workers fetched {} rows, {} batches still queued",
            rows_fetched.load(Ordering::Relaxed),
            queue.queued(),
        );
        if let Err(e) = queue.push(QueueItem::Sentinel).await {
            log::error!("[pipeline] {table}: could not signal end of work: {e}");
        }
        let queue_high_water = queue.high_water_mark();
        log::debug!(
            "[pipeline] {table}: queue peaked at {queue_high_water} of {}",
            queue.capacity()
        );
        drop(queue);

        let outcome = writer_handle.await.map_err(|e| IngestError::Writer {
            message: e.to_string(),
        })?;

        if outcome.successful_batches + outcome.failed_batches != total_batches {
            log::warn!(
                "[pipeline] {table}: writer saw {} of {total_batches} batches",
                outcome.successful_batches + outcome.failed_batches,
            );
        }

        let mut failed_date_ranges = outcome.failed_date_ranges;
        failed_date_ranges.sort_unstable();

        let result = ParallelFetchResult {
            table,
            total_rows: outcome.total_rows,
            successful_batches: outcome.successful_batches,
            failed_batches: outcome.failed_batches,
            failed_date_ranges,
            duration_seconds: started.elapsed().as_secs_f64(),
            completed_at: Utc::now(),
        };
        log_state(&result.table, RunState::Complete);

        if result.has_failures() {
            log::warn!(
                "[pipeline] {}: {} rows in {:.1}s, {} of {} batches failed",
                result.table,
                result.total_rows,
                result.duration_seconds,
                result.failed_batches,
                total_batches,
            );
        } else {
            log::info!(
                "[pipeline] {}: {} rows in {:.1}s ({} batches)",
                result.table,
                result.total_rows,
                result.duration_seconds,
                total_batches,
            );
        }

        Ok(PipelineOutcome {
            result,
            sink: outcome.sink,
            queue_high_water,
        })
    }
}
