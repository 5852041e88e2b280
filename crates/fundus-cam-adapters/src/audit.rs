//! Security audit log.
//!
//! One file per UTC day, `security_audit_YYYYMMDD.log`, with lines of the form
//! `YYYY-mm-dd HH:MM:SS - LEVEL - {json}`. Successful actions are written at
//! `INFO`, failures and violations at `ERROR`. [`FileAuditLog::summarize`]
//! reads the files back for the `audit` command and `/security/stats`.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use fundus_cam_core::domain::{ActionType, Actor, AuditEntry};
use fundus_cam_core::AuditSink;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Number of users listed in [`AuditSummary::top_users`].
const TOP_USERS: usize = 10;
/// Number of trailing entries kept in the detail lists.
const DETAIL_TAIL: usize = 5;

/// Current time as an RFC 3339 UTC string.
#[must_use]
pub fn now_rfc3339() -> String {
    match OffsetDateTime::now_utc().format(&Rfc3339) {
        Ok(ts) => ts,
        Err(e) => {
            debug!("Timestamp format failed: {e}");
            String::from("1970-01-01T00:00:00Z")
        }
    }
}

/// File-backed [`AuditSink`].
#[derive(Debug)]
pub struct FileAuditLog {
    dir: PathBuf,
    enabled: bool,
    write_lock: Mutex<()>,
}

impl FileAuditLog {
    /// Opens (creating if needed) the log directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Result<Self> {
        let dir = dir.into();
        if enabled {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;
        }
        Ok(Self {
            dir,
            enabled,
            write_lock: Mutex::new(()),
        })
    }

    /// The log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the log file for `date`.
    #[must_use]
    pub fn log_file_for(&self, date: Date) -> PathBuf {
        let stamp = date
            .format(format_description!("[year][month][day]"))
            .unwrap_or_default();
        self.dir.join(format!("security_audit_{stamp}.log"))
    }

    fn append_at(&self, entry: &AuditEntry, at: OffsetDateTime) -> Result<()> {
        let line = format_line(entry, at)?;
        let path = self.log_file_for(at.date());
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Summarizes the last `days` days (plus today).
    ///
    /// # Errors
    ///
    /// Returns an error if an existing log file cannot be read. Malformed
    /// lines are skipped.
    pub fn summarize(&self, days: u32) -> Result<AuditSummary> {
        self.summarize_at(days, OffsetDateTime::now_utc())
    }

    /// [`Self::summarize`] relative to `now`.
    ///
    /// # Errors
    ///
    /// See [`Self::summarize`].
    pub fn summarize_at(&self, days: u32, now: OffsetDateTime) -> Result<AuditSummary> {
        let mut entries = Vec::new();
        for back in (0..=days).rev() {
            let Some(date) = now.date().checked_sub(Duration::days(i64::from(back))) else {
                continue;
            };
            let path = self.log_file_for(date);
            if !path.exists() {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            entries.extend(text.lines().filter_map(parse_line).map(|p| p.entry));
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(AuditSummary::from_entries(days, &entries, now))
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.append_at(entry, OffsetDateTime::now_utc())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Renders one log line.
///
/// # Errors
///
/// Returns an error if the entry cannot be serialized.
pub fn format_line(entry: &AuditEntry, at: OffsetDateTime) -> Result<String> {
    let stamp = at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .context("Failed to format log time")?;
    let level = if entry.success { "INFO" } else { "ERROR" };
    let json = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
    Ok(format!("{stamp} - {level} - {json}"))
}

/// A parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub logged_at: String,
    pub level: String,
    pub entry: AuditEntry,
}

/// Parses a line written by [`format_line`]. Returns `None` for anything else.
#[must_use]
pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let mut parts = line.trim().splitn(3, " - ");
    let logged_at = parts.next()?.to_string();
    let level = parts.next()?.to_string();
    let entry = serde_json::from_str(parts.next()?).ok()?;
    Some(ParsedLine {
        logged_at,
        level,
        entry,
    })
}

/// Aggregate view over recent audit entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSummary {
    pub period_days: u32,
    pub total_actions: usize,
    /// Percentage of successful entries, two decimals.
    pub success_rate: f64,
    pub action_types: BTreeMap<String, usize>,
    /// Entries per `YYYY-MM-DD`.
    pub daily_activity: BTreeMap<String, usize>,
    /// Most active users by email, busiest first.
    pub top_users: Vec<(String, usize)>,
    pub security_violations: usize,
    pub failed_logins: usize,
    pub recent_activities_24h: usize,
    pub violation_details: Vec<AuditEntry>,
    pub failed_login_details: Vec<AuditEntry>,
}

impl AuditSummary {
    /// Aggregates `entries`, which must be sorted by timestamp.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_entries(period_days: u32, entries: &[AuditEntry], now: OffsetDateTime) -> Self {
        let total = entries.len();
        let succeeded = entries.iter().filter(|e| e.success).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            (succeeded as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        let mut action_types = BTreeMap::new();
        let mut daily_activity = BTreeMap::new();
        let mut users: HashMap<&str, usize> = HashMap::new();
        for e in entries {
            *action_types.entry(e.action_type.to_string()).or_insert(0) += 1;
            let day: String = e.timestamp.chars().take(10).collect();
            *daily_activity.entry(day).or_insert(0) += 1;
            if let Some(email) = e.user_email.as_deref() {
                *users.entry(email).or_insert(0) += 1;
            }
        }
        let mut top_users: Vec<(String, usize)> =
            users.into_iter().map(|(u, n)| (u.to_string(), n)).collect();
        top_users.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_users.truncate(TOP_USERS);

        let violations: Vec<&AuditEntry> = entries
            .iter()
            .filter(|e| e.action_type == ActionType::SecurityViolation)
            .collect();
        let failed_logins: Vec<&AuditEntry> = entries
            .iter()
            .filter(|e| e.action_type == ActionType::Login && !e.success)
            .collect();

        let cutoff = now - Duration::hours(24);
        let recent = entries
            .iter()
            .filter(|e| {
                OffsetDateTime::parse(&e.timestamp, &Rfc3339).is_ok_and(|t| t > cutoff)
            })
            .count();

        Self {
            period_days,
            total_actions: total,
            success_rate,
            action_types,
            daily_activity,
            top_users,
            security_violations: violations.len(),
            failed_logins: failed_logins.len(),
            recent_activities_24h: recent,
            violation_details: tail(&violations),
            failed_login_details: tail(&failed_logins),
        }
    }
}

fn tail(entries: &[&AuditEntry]) -> Vec<AuditEntry> {
    let start = entries.len().saturating_sub(DETAIL_TAIL);
    entries[start..].iter().map(|e| (*e).clone()).collect()
}

/// Typed helpers for the actions the gateway audits.
///
/// Failures to write are logged and swallowed: an audit outage never fails
/// the request that triggered it. Disabled sinks are skipped entirely.
pub trait AuditTrail: AuditSink {
    /// Records `entry`, logging instead of failing.
    fn emit(&self, entry: AuditEntry) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.record(&entry) {
            warn!("Failed to write audit entry {}: {e:#}", entry.action_type);
        }
    }

    fn log_login(&self, actor: &Actor, success: bool) {
        let mut entry = AuditEntry::new(ActionType::Login, actor, now_rfc3339()).detail("login_attempt", true);
        entry.success = success;
        self.emit(entry);
    }

    fn log_image_upload(&self, actor: &Actor, filename: &str, patient_id: Option<i64>) {
        self.emit(
            AuditEntry::new(ActionType::UploadImage, actor, now_rfc3339())
                .detail("filename", filename)
                .detail("patient_id", patient_id)
                .detail("file_type", "medical_image"),
        );
    }

    fn log_image_analysis(
        &self,
        actor: &Actor,
        filename: &str,
        prediction: &str,
        confidence: f32,
        patient_id: Option<i64>,
    ) {
        self.emit(
            AuditEntry::new(ActionType::AnalyzeImage, actor, now_rfc3339())
                .detail("filename", filename)
                .detail("prediction", prediction)
                .detail("confidence", f64::from(confidence))
                .detail("patient_id", patient_id),
        );
    }

    fn log_report_generation(&self, actor: &Actor, patient_id: i64, report_type: &str) {
        self.emit(
            AuditEntry::new(ActionType::GenerateReport, actor, now_rfc3339())
                .detail("patient_id", patient_id)
                .detail("report_type", report_type),
        );
    }

    fn log_patient_creation(&self, actor: &Actor, patient_name: &str, patient_id: i64) {
        self.emit(
            AuditEntry::new(ActionType::CreatePatient, actor, now_rfc3339())
                .detail("patient_name", patient_name)
                .detail("patient_id", patient_id),
        );
    }

    /// `action` is `encrypt` or `decrypt`.
    fn log_encryption_action(&self, actor: &Actor, action: &str, filename: &str) {
        self.emit(
            AuditEntry::new(ActionType::EncryptionAction, actor, now_rfc3339())
                .detail("encryption_action", action)
                .detail("filename", filename),
        );
    }

    fn log_security_violation(&self, details: BTreeMap<String, serde_json::Value>, ip_address: Option<&str>) {
        let actor = Actor {
            ip_address: ip_address.map(str::to_string),
            ..Actor::default()
        };
        let mut entry = AuditEntry::new(ActionType::SecurityViolation, &actor, now_rfc3339());
        entry.success = false;
        entry.details = details;
        self.emit(entry);
    }

    fn log_temp_file_cleanup(&self, actor: &Actor, filename: &str) {
        self.emit(
            AuditEntry::new(ActionType::DeleteFile, actor, now_rfc3339())
                .detail("temp_file_cleanup", filename),
        );
    }
}

impl<T: AuditSink + ?Sized> AuditTrail for T {}
