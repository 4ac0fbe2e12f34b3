//! Single-writer loop that drains the queue into an [`EventSink`].
//!
//! Runs on one blocking thread for the whole run and is the only code that
//! touches the sink while workers are active.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{NaiveDate, Utc};
use eventsync_database::{EventSink, FetchRecord, TableSchema};
use eventsync_ingest_models::{BatchCallback, BatchProgress, BatchResult, DateChunk, QueueItem};

use crate::queue::QueueReceiver;

/// Writer configuration for one run.
pub struct WriterLoop<S> {
    sink: S,
    table: String,
    /// The table is already present (append mode), so it is never created.
    table_ready: bool,
    span: DateChunk,
    total_batches: usize,
    on_batch_complete: Option<BatchCallback>,
}

/// What the writer saw, handed back together with the sink.
#[derive(Debug)]
pub struct WriterOutcome<S> {
    /// The sink, returned to the caller.
    pub sink: S,
    /// Rows from every written batch.
    pub total_rows: u64,
    /// Batches written.
    pub successful_batches: usize,
    /// Batches that failed to fetch or write.
    pub failed_batches: usize,
    /// Ranges of the failed batches, in processing order.
    pub failed_date_ranges: Vec<(NaiveDate, NaiveDate)>,
}

impl<S: EventSink> WriterLoop<S> {
    /// Creates a writer for `table`. `span` is the full date range of the
    /// run, recorded in the sink's fetch history.
    #[must_use]
    pub fn new(
        sink: S,
        table: impl Into<String>,
        table_exists: bool,
        span: DateChunk,
        total_batches: usize,
        on_batch_complete: Option<BatchCallback>,
    ) -> Self {
        Self {
            sink,
            table: table.into(),
            table_ready: table_exists,
            span,
            total_batches,
            on_batch_complete,
        }
    }

    /// Pops items until the sentinel arrives (or every sender is gone),
    /// writing each successful batch.
    ///
    /// Blocks the calling thread. Never fails: write errors are counted as
    /// failed batches.
    pub fn run(mut self, mut rx: QueueReceiver) -> WriterOutcome<S> {
        let mut outcome = Tally::default();

        loop {
            match rx.blocking_pop() {
                Some(QueueItem::Batch(batch)) => {
                    let progress = self.process(batch, &mut outcome);
                    self.report(&progress);
                }
                Some(QueueItem::Sentinel) => break,
                None => {
                    log::warn!(
                        "[writer] {}: queue closed before the end-of-work marker",
                        self.table
                    );
                    break;
                }
            }
        }

        if outcome.successful_batches > 0 {
            let record = FetchRecord {
                table: self.table.clone(),
                from_date: self.span.from,
                to_date: self.span.to,
                row_count: outcome.total_rows,
                fetched_at: Utc::now(),
            };
            if let Err(e) = self.sink.record_fetch(&record) {
                log::warn!("[writer] {}: failed to record fetch history: {e}", self.table);
            }
        }

        WriterOutcome {
            sink: self.sink,
            total_rows: outcome.total_rows,
            successful_batches: outcome.successful_batches,
            failed_batches: outcome.failed_batches,
            failed_date_ranges: outcome.failed_date_ranges,
        }
    }

    fn process(&mut self, batch: BatchResult, tally: &mut Tally) -> BatchProgress {
        let chunk = batch.chunk();
        let written = if batch.success {
            self.write(&batch)
        } else {
            Err(batch
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()))
        };

        let index = tally.successful_batches + tally.failed_batches + 1;
        let (rows, error) = match written {
            Ok(()) => {
                tally.total_rows += batch.row_count;
                tally.successful_batches += 1;
                (batch.row_count, None)
            }
            Err(error) => {
                tally.failed_batches += 1;
                tally.failed_date_ranges.push(chunk.as_range());
                (0, Some(error))
            }
        };

        BatchProgress {
            from: chunk.from,
            to: chunk.to,
            batch_index: index,
            total_batches: self.total_batches,
            rows,
            success: error.is_none(),
            error,
        }
    }

    fn write(&mut self, batch: &BatchResult) -> Result<(), String> {
        if !self.table_ready {
            self.sink
                .create_table(&self.table, &TableSchema::events())
                .map_err(|e| {
                    log::error!("[writer] {}: create table failed: {e}", self.table);
                    format!("create table failed: {e}")
                })?;
            log::info!("[writer] Created table {}", self.table);
            self.table_ready = true;
        }

        let inserted = self
            .sink
            .append_batch(&self.table, &batch.rows)
            .map_err(|e| {
                log::error!(
                    "[writer] {}: append failed for {}: {e}",
                    self.table,
                    batch.chunk()
                );
                format!("append failed: {e}")
            })?;

        if inserted < batch.row_count {
            log::debug!(
                "[writer] {}: {}: {} of {} rows were already stored",
                self.table,
                batch.chunk(),
                batch.row_count - inserted,
                batch.row_count,
            );
        }
        Ok(())
    }

    fn report(&self, progress: &BatchProgress) {
        let Some(callback) = &self.on_batch_complete else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
            log::warn!(
                "[writer] progress callback panicked for batch {}/{}",
                progress.batch_index,
                progress.total_batches
            );
        }
    }
}

#[derive(Default)]
struct Tally {
    total_rows: u64,
    successful_batches: usize,
    failed_batches: usize,
    failed_date_ranges: Vec<(NaiveDate, NaiveDate)>,
}
