//! Gateway persistence ports: analysis rows and the audit trail.

use crate::domain::{AnalysisRecord, AuditEntry};

/// Appends one row per analysed upload.
pub trait RecordSink: Send + Sync {
    /// Persists `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored.
    fn append(&self, record: &AnalysisRecord) -> anyhow::Result<()>;
}

/// Receives audit entries for sensitive actions.
pub trait AuditSink: Send + Sync {
    /// Records `entry`. Disabled sinks accept and drop entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()>;

    /// Whether entries are actually kept.
    fn is_enabled(&self) -> bool {
        true
    }
}
