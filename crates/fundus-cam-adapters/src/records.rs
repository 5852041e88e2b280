//! JSON Lines analysis record store.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use fundus_cam_core::domain::AnalysisRecord;
use fundus_cam_core::RecordSink;
use tracing::warn;

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlRecordSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlRecordSink {
    /// Creates the sink, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all records back, optionally only those of `patient_id`.
    /// Unparseable lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(&self, patient_id: Option<i64>) -> Result<Vec<AnalysisRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut records = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AnalysisRecord>(&line) {
                Ok(r) if patient_id.is_none() || r.patient_id == patient_id => records.push(r),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed record at line {}: {e}", n + 1),
            }
        }
        Ok(records)
    }
}

impl RecordSink for JsonlRecordSink {
    fn append(&self, record: &AnalysisRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{json}").with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(patient_id: Option<i64>, prediction: &str) -> AnalysisRecord {
        AnalysisRecord {
            user_id: Some(1),
            patient_id,
            timestamp: "2024-05-01T08:00:00Z".into(),
            prediction: prediction.into(),
            confidence: 0.875,
            filename: "abc_eye.png.encrypted".into(),
        }
    }

    #[test]
    fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlRecordSink::new(dir.path().join("db/analyses.jsonl")).unwrap();
        sink.append(&record(Some(4), "Glaucoma Detected")).unwrap();
        sink.append(&record(Some(5), "No Glaucoma")).unwrap();

        let all = sink.load(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], record(Some(4), "Glaucoma Detected"));
        let only = sink.load(Some(5)).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].prediction, "No Glaucoma");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlRecordSink::new(dir.path().join("none.jsonl")).unwrap();
        assert!(sink.load(None).unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.jsonl");
        let sink = JsonlRecordSink::new(&path).unwrap();
        sink.append(&record(None, "No Glaucoma")).unwrap();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("{broken\n\n");
        fs::write(&path, text).unwrap();
        assert_eq!(sink.load(None).unwrap().len(), 1);
    }
}
