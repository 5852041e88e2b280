//! Batch progress port.

use crate::domain::ReportEntry;

/// Lifecycle of one batch run, in emission order per image.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// An image is about to go through the pipeline.
    Started {
        path: String,
        /// 0-based position in the batch.
        index: usize,
        total: Option<usize>,
    },
    /// The image was classified and its entry written.
    Completed { entry: ReportEntry },
    /// Unreadable, undecodable or rejected by the pipeline.
    Skipped { path: String, reason: String },
    /// Emitted once after the last image.
    Finished { processed: usize, skipped: usize },
}

/// Receives [`ProgressEvent`]s from the batch driver.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}
