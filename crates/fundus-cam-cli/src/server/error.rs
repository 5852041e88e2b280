//! HTTP error type and JSON error bodies.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fundus_cam_adapters::PolicyViolation;
use fundus_cam_core::AnalyzeError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

/// Every failure a route can answer with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    /// Malformed request or rejected upload.
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    /// Storage or task failure. The message is logged, not returned.
    #[error("internal error")]
    Internal(String),
}

/// JSON body returned on error.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<&'static str>,
}

impl ApiError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Analyze(e) => e.code(),
            Self::BadRequest(_) => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Analyze(e) => StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let stage = match self {
            Self::Analyze(e) => e.stage().map(fundus_cam_core::Stage::as_str),
            _ => None,
        };
        ErrorBody {
            error: self.to_string(),
            code: self.code(),
            stage,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Internal(detail) => error!("Request failed: {detail}"),
            Self::Analyze(e) if !e.is_client_error() => error!(code = e.code(), "Analysis failed: {e}"),
            other => warn!(code = other.code(), "Request rejected: {other}"),
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(e.body_text())
        } else {
            Self::BadRequest(e.body_text())
        }
    }
}

impl From<PolicyViolation> for ApiError {
    fn from(v: PolicyViolation) -> Self {
        match v {
            PolicyViolation::TooLarge { .. } => Self::PayloadTooLarge(v.to_string()),
            PolicyViolation::InvalidName(_) | PolicyViolation::Extension { .. } => Self::BadRequest(v.to_string()),
        }
    }
}
