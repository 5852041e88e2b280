//! Gateway-side records: persisted analysis rows and audit entries.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One analysed upload, keyed by user, patient and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// Owning user, if the caller was identified.
    pub user_id: Option<i64>,
    /// Patient the image belongs to, if given.
    pub patient_id: Option<i64>,
    /// Analysis time (RFC 3339, UTC).
    pub timestamp: String,
    /// Predicted label.
    pub prediction: String,
    /// Probability of the predicted label.
    pub confidence: f32,
    /// Stored filename (with `.encrypted` suffix when encrypted at rest).
    pub filename: String,
}

/// Kind of sensitive action recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Login,
    Logout,
    UploadImage,
    AnalyzeImage,
    GenerateReport,
    CreatePatient,
    ViewPatient,
    DeleteFile,
    EncryptionAction,
    SecurityViolation,
}

impl ActionType {
    /// Wire name, as written in the log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::UploadImage => "UPLOAD_IMAGE",
            Self::AnalyzeImage => "ANALYZE_IMAGE",
            Self::GenerateReport => "GENERATE_REPORT",
            Self::CreatePatient => "CREATE_PATIENT",
            Self::ViewPatient => "VIEW_PATIENT",
            Self::DeleteFile => "DELETE_FILE",
            Self::EncryptionAction => "ENCRYPTION_ACTION",
            Self::SecurityViolation => "SECURITY_VIOLATION",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    /// User email, if known.
    pub email: Option<String>,
    /// User id, if known.
    pub id: Option<i64>,
    /// Client address, if known.
    pub ip_address: Option<String>,
}

impl Actor {
    /// Actor identified by email and id.
    #[must_use]
    pub fn user(email: impl Into<String>, id: i64) -> Self {
        Self {
            email: Some(email.into()),
            id: Some(id),
            ip_address: None,
        }
    }

    /// Adds the client address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

/// One line of the security audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Event time (RFC 3339).
    pub timestamp: String,
    /// What happened.
    pub action_type: ActionType,
    pub user_email: Option<String>,
    pub user_id: Option<i64>,
    pub ip_address: Option<String>,
    /// False for failures and violations.
    pub success: bool,
    /// Action-specific details.
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub error_message: Option<String>,
}

impl AuditEntry {
    /// Creates a successful entry for `actor`.
    #[must_use]
    pub fn new(action_type: ActionType, actor: &Actor, timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            action_type,
            user_email: actor.email.clone(),
            user_id: actor.id,
            ip_address: actor.ip_address.clone(),
            success: true,
            details: BTreeMap::new(),
            error_message: None,
        }
    }

    /// Adds a detail field.
    #[must_use]
    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Marks the entry as failed with `message`.
    #[must_use]
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }
}
