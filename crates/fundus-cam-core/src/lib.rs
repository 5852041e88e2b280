//! fundus-cam core: preprocessing, glaucoma classification, Grad-CAM
//! attribution and heatmap rendering for fundus images.
//!
//! The crate is organised hexagonally: [`domain`] holds plain data types,
//! [`ports`] the traits adapters implement, and the remaining modules the
//! pipeline stages that [`service::InferenceService`] drives.

pub mod attribution;
pub mod domain;
pub mod error;
pub mod inference;
pub mod ports;
pub mod preprocess;
pub mod render;
pub mod service;

pub use domain::{
    AnalysisReport, AttributionMethod, ImportanceMap, Prediction, RawImage, ReportEntry, SourceImage,
};
pub use error::{AnalyzeError, AttributionError, Stage};
pub use inference::TargetLayer;
pub use ports::{
    AuditSink, Classifier, ContainerDecoder, ImageSource, ProgressEvent, ProgressSink, RecordSink, ReportOutput,
};
pub use service::{Explanation, InferenceService};
