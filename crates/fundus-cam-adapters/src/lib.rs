//! Fundus CAM Adapters - External adapters for fundus-cam.
//!
//! This crate provides adapters for:
//! - Filesystem image source
//! - DICOM container decoding
//! - Checkpoint downloading and caching
//! - Encryption at rest, upload storage and TTL cleanup
//! - Audit log and analysis records

pub mod audit;
pub mod crypto;
pub mod dicom;
pub mod fs;
pub mod janitor;
pub mod models;
pub mod records;
pub mod store;

pub use audit::{AuditSummary, AuditTrail, FileAuditLog};
pub use crypto::{FileCipher, ENCRYPTED_SUFFIX};
pub use dicom::DicomDecoder;
pub use fs::FsImageSource;
pub use janitor::{remove_old_files, run_cleanup_loop, SweepReport};
pub use models::{model_path, models_dir};
pub use records::JsonlRecordSink;
pub use store::{PolicyViolation, StoredUpload, UploadPolicy, UploadStore};
