//! Progress reporting trait for long-running imports.
//!
//! [`ProgressCallback`] decouples progress reporting from the rendering
//! backend (an `indicatif` bar in the CLI). The ingest
//! pipeline reports one unit per completed date chunk.

/// Trait for reporting progress from long-running operations.
///
/// Implementations must be `Send + Sync`: the pipeline reports from the
/// writer thread while the bar is owned elsewhere.
pub trait ProgressCallback: Send + Sync {
    /// Set the total expected units of work (enables percentage/ETA).
    fn set_total(&self, total: u64);

    /// Advance progress by `delta` units.
    fn inc(&self, delta: u64);

    /// Update the message displayed alongside the progress indicator.
    fn set_message(&self, msg: String);

    /// Mark progress as complete with a final message.
    fn finish(&self, msg: String);
}
