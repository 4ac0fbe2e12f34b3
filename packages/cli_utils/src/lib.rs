#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared CLI utilities for eventsync.
//!
//! Provides an `indicatif`-backed progress bar behind the
//! [`ProgressCallback`] trait, [`batch_reporter`] which drives it from the
//! pipeline's per-batch callback, and [`init_logger`] which sets up
//! `indicatif-log-bridge` so that `log::info!` and friends are suspended
//! while progress bars redraw.

use std::sync::Arc;

use eventsync_ingest_models::{BatchCallback, BatchProgress};
use eventsync_source::progress::ProgressCallback;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// An `indicatif` [`ProgressBar`] that implements [`ProgressCallback`].
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    /// Creates a progress bar for step-level progress (e.g. batches 3/5).
    /// Total is known up front so this starts as a bar immediately.
    ///
    /// `label` stays in front of the bar for its whole life; messages set
    /// through [`ProgressCallback::set_message`] appear after it.
    #[must_use]
    pub fn steps_bar(multi: &MultiProgress, label: &str, total: u64) -> Arc<dyn ProgressCallback> {
        Arc::new(Self::labelled(multi, label, total))
    }

    fn labelled(multi: &MultiProgress, label: &str, total: u64) -> Self {
        let bar = multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix} {wide_bar:.green/dim} {pos}/{len} [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        bar.set_prefix(label.to_string());

        Self { bar }
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, msg: String) {
        self.bar.set_message(msg);
    }

    fn finish(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Adapts a [`ProgressCallback`] to the pipeline's per-batch callback.
///
/// Advances one step per processed batch and logs failed batches as
/// warnings.
#[must_use]
pub fn batch_reporter(progress: Arc<dyn ProgressCallback>) -> BatchCallback {
    Arc::new(move |batch: &BatchProgress| {
        progress.inc(1);
        if batch.success {
            progress.set_message(format!("{}..{} ({} rows)", batch.from, batch.to, batch.rows));
        } else {
            log::warn!(
                "Batch {}/{} ({}..{}) failed: {}",
                batch.batch_index,
                batch.total_batches,
                batch.from,
                batch.to,
                batch.error.as_deref().unwrap_or("unknown error"),
            );
        }
    })
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok(); // Ignore error if logger was already set (e.g., in tests)

    log::set_max_level(level);

    multi
}
