//! Test support utilities for fundus-cam.
//!
//! Provides mocks of the core ports, builders for synthetic fundus
//! images and DICOM files, and random-weight checkpoints.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fundus_cam_core::{InferenceService, RawImage};
//! use fundus_cam_test_support::{MockClassifier, SyntheticImageBuilder};
//!
//! let service = InferenceService::with_classifier(Arc::new(MockClassifier::new()));
//! let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::bright_ring(256, 256));
//! let report = service.analyze(&RawImage::new(&png, "image/png")).unwrap();
//! assert!(report.heatmap_image.starts_with("data:image/png;base64,"));
//! ```

mod builders;
mod checkpoint;
mod dicom;
mod mocks;

pub use builders::SyntheticImageBuilder;
pub use checkpoint::write_random_checkpoint;
pub use dicom::DicomBuilder;
pub use mocks::{
    MockAuditSink, MockClassifier, MockImageSource, MockProgressSink, MockRecordSink, MockReportOutput,
};
