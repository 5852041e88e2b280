//! JSON output adapter for batch reports.

use std::io::{self, Write};
use std::sync::Mutex;

use anyhow::Result;
use fundus_cam_core::{ReportEntry, ReportOutput};

/// Writes report entries as JSON Lines, or as one array at the end.
pub struct JsonOutput {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonOutput {
    /// Creates a new JSON output writing to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Writes a batch of entries as a JSON array.
    #[allow(clippy::significant_drop_tightening)]
    pub fn write_array(&self, entries: &[ReportEntry], pretty: bool) -> Result<()> {
        let json = if pretty {
            serde_json::to_string_pretty(entries)?
        } else {
            serde_json::to_string(entries)?
        };
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {e}"))?;
        writeln!(writer, "{json}")?;
        Ok(())
    }
}

impl ReportOutput for JsonOutput {
    #[allow(clippy::significant_drop_tightening)]
    fn write(&self, entry: &ReportEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {e}"))?;
        writeln!(writer, "{json}")?;
        Ok(())
    }

    #[allow(clippy::significant_drop_tightening)]
    fn flush(&self) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {e}"))?;
        writer.flush()?;
        Ok(())
    }
}
