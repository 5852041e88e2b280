//! Core domain types for fundus image analysis.

mod image;
mod importance;
mod record;
mod report;

pub use image::{has_dicom_magic, mime_from_extension, RawImage, SourceImage, DICOM_MIME};
pub use importance::{AttributionMethod, ImportanceMap, NORMALIZATION_EPSILON};
pub use record::{ActionType, Actor, AnalysisRecord, AuditEntry};
pub use report::{AnalysisReport, Prediction, ReportEntry, CLASS_LABELS, NUM_CLASSES};
