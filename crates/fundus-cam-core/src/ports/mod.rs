//! Port definitions for hexagonal architecture.
//!
//! These traits define the boundaries between the domain core and external adapters.

mod classifier;
mod container;
mod image_source;
mod progress;
mod records;
mod report_output;

pub use classifier::Classifier;
pub use container::ContainerDecoder;
pub use image_source::ImageSource;
pub use progress::{ProgressEvent, ProgressSink};
pub use records::{AuditSink, RecordSink};
pub use report_output::ReportOutput;
