//! Output port for batch reports.

use crate::domain::ReportEntry;

/// Port for writing batch analysis entries.
pub trait ReportOutput: Send + Sync {
    /// Writes a single entry.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write(&self, entry: &ReportEntry) -> anyhow::Result<()>;

    /// Flushes any buffered output.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    fn flush(&self) -> anyhow::Result<()>;
}
