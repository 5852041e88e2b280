//! Route handlers.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fundus_cam_adapters::audit::now_rfc3339;
use fundus_cam_adapters::{AuditTrail, FileCipher, StoredUpload, UploadStore};
use fundus_cam_core::domain::{mime_from_extension, Actor, AnalysisRecord};
use fundus_cam_core::{AnalysisReport, AnalyzeError, Explanation, RawImage};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{ApiError, SharedState};

/// The multipart field carrying the image.
const FILE_FIELD: &str = "file";

/// A decoded multipart upload.
struct Upload {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
    /// Other text fields (`user_id`, `user_email`, `patient_id`).
    fields: HashMap<String, String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut file = None;
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == FILE_FIELD {
            let filename = field.file_name().unwrap_or("upload").to_string();
            let content_type = field.content_type().map_or_else(
                || {
                    let ext = std::path::Path::new(&filename)
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or_default();
                    mime_from_extension(ext).to_string()
                },
                str::to_string,
            );
            let bytes = field.bytes().await?.to_vec();
            file = Some((filename, content_type, bytes));
        } else {
            fields.insert(name, field.text().await?);
        }
    }
    let (filename, content_type, bytes) =
        file.ok_or_else(|| ApiError::BadRequest(format!("missing multipart field '{FILE_FIELD}'")))?;
    debug!(%filename, %content_type, bytes = bytes.len(), "Upload received");
    Ok(Upload {
        filename,
        content_type,
        bytes,
        fields,
    })
}

/// Runs the pipeline on the blocking pool, bounded by the configured timeout.
///
/// A timed-out task keeps running to completion; its result is dropped.
async fn explain(state: &SharedState, raw: RawImage<'static>) -> Result<Explanation, ApiError> {
    let service = state.service.clone();
    let task = tokio::task::spawn_blocking(move || service.explain(&raw));
    match tokio::time::timeout(state.timeout, task).await {
        Err(_) => Err(AnalyzeError::TimedOut(state.timeout).into()),
        Ok(Err(e)) => Err(ApiError::Internal(format!("analysis task failed: {e}"))),
        Ok(Ok(result)) => Ok(result?),
    }
}

/// First address of `X-Forwarded-For`, then `X-Real-IP`, then the peer.
fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    if let Some(first) = header_value("x-forwarded-for").and_then(|v| v.split(',').next()) {
        return first.trim().to_string();
    }
    if let Some(real) = header_value("x-real-ip") {
        return real.to_string();
    }
    peer.map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}

fn parse_id(fields: &HashMap<String, String>, key: &str) -> Result<Option<i64>, ApiError> {
    fields
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| ApiError::BadRequest(format!("{key} must be an integer, got '{v}'")))
        })
        .transpose()
}

fn violation(state: &SharedState, kind: &str, filename: &str, reason: &str, ip: &str) {
    let details = BTreeMap::from([
        ("violation_type".to_string(), Value::from(kind)),
        ("filename".to_string(), Value::from(filename)),
        ("reason".to_string(), Value::from(reason)),
    ]);
    state.audit.log_security_violation(details, Some(ip));
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub uptime_secs: u64,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let ready = state.service.is_ready();
    Json(HealthResponse {
        status: if ready { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        model_ready: ready,
        reason: state.service.unavailable_reason().map(str::to_string),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

pub async fn analyze(State(state): State<SharedState>, multipart: Multipart) -> Result<Json<AnalysisReport>, ApiError> {
    let upload = read_upload(multipart).await?;
    let explanation = explain(&state, RawImage::owned(upload.bytes, upload.content_type)).await?;
    let report = explanation.report();
    info!(
        filename = %upload.filename,
        class = report.prediction_class,
        probability = report.probability,
        "Image analysed"
    );
    Ok(Json(report))
}

pub async fn heatmap(State(state): State<SharedState>, multipart: Multipart) -> Result<Response, ApiError> {
    let upload = read_upload(multipart).await?;
    let explanation = explain(&state, RawImage::owned(upload.bytes, upload.content_type)).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], explanation.artifact.into_png()).into_response())
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Name to use with `/files/`.
    pub filename: String,
    pub original_filename: String,
    pub encrypted: bool,
    pub message: &'static str,
    /// The report, or `{error, code, details}` when analysis failed.
    pub analysis: Value,
}

/// Stores the upload, analyses it, records the result and encrypts the
/// stored copy. A failed analysis still stores the file.
pub async fn upload_file(
    State(state): State<SharedState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let ip = client_ip(&headers, peer.as_ref());
    let upload = match read_upload(multipart).await {
        Ok(u) => u,
        Err(e @ ApiError::PayloadTooLarge(_)) => {
            violation(&state, "oversized_request", "", &e.to_string(), &ip);
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let actor = Actor {
        email: upload.fields.get("user_email").cloned(),
        id: parse_id(&upload.fields, "user_id")?,
        ip_address: Some(ip.clone()),
    };
    let patient_id = parse_id(&upload.fields, "patient_id")?;

    if !RawImage::new(&[], upload.content_type.as_str()).has_image_mime() {
        let reason = format!("content type '{}' is not an image", upload.content_type);
        violation(&state, "invalid_content_type", &upload.filename, &reason, &ip);
        return Err(ApiError::BadRequest(reason));
    }
    if let Err(v) = state.policy.check(&upload.filename, upload.bytes.len() as u64) {
        violation(&state, "invalid_upload", &upload.filename, &v.to_string(), &ip);
        return Err(v.into());
    }

    let Upload {
        filename: original_filename,
        content_type,
        bytes,
        ..
    } = upload;

    let store = state.store.clone();
    let name = original_filename.clone();
    let (stored, bytes) = tokio::task::spawn_blocking(move || store.save(&name, &bytes).map(|s| (s, bytes)))
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    state.audit.log_image_upload(&actor, &stored.filename, patient_id);

    let analysis = explain(&state, RawImage::owned(bytes, content_type)).await;
    let stored = seal(&state, stored).await;
    if stored.encrypted {
        state.audit.log_encryption_action(&actor, "encrypt", &stored.filename);
    }

    let (message, analysis) = match analysis {
        Ok(explanation) => {
            let report = explanation.report();
            let record = AnalysisRecord {
                user_id: actor.id,
                patient_id,
                timestamp: now_rfc3339(),
                prediction: report.prediction_label.clone(),
                confidence: report.probability,
                filename: stored.filename.clone(),
            };
            if let Err(e) = state.records.append(&record) {
                warn!("Failed to record analysis of {}: {e:#}", stored.filename);
            }
            state.audit.log_image_analysis(
                &actor,
                &stored.filename,
                &report.prediction_label,
                report.probability,
                patient_id,
            );
            let value = serde_json::to_value(&report).map_err(|e| ApiError::Internal(e.to_string()))?;
            ("Image stored and analysed.", value)
        }
        Err(e) => {
            warn!("Analysis of {} failed: {e}", stored.filename);
            (
                "Image stored; analysis failed.",
                json!({ "error": "analysis failed", "code": e.code(), "details": e.to_string() }),
            )
        }
    };

    Ok(Json(UploadResponse {
        filename: stored.filename,
        original_filename,
        encrypted: stored.encrypted,
        message,
        analysis,
    }))
}

/// Encrypts the stored copy; on failure the plaintext stays and a warning is logged.
async fn seal(state: &SharedState, stored: StoredUpload) -> StoredUpload {
    if !state.store.encrypts() {
        return stored;
    }
    let store = state.store.clone();
    let fallback = stored.clone();
    match tokio::task::spawn_blocking(move || store.seal(stored)).await {
        Ok(Ok(sealed)) => sealed,
        Ok(Err(e)) => {
            warn!("Failed to encrypt {}: {e:#}", fallback.filename);
            fallback
        }
        Err(e) => {
            warn!("Encryption task for {} failed: {e}", fallback.filename);
            fallback
        }
    }
}

pub async fn download_file(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = state
        .store
        .resolve(&filename)
        .ok_or_else(|| ApiError::NotFound(format!("no stored file named '{filename}'")))?;

    let store = state.store.clone();
    let name = filename.clone();
    let bytes = tokio::task::spawn_blocking(move || store.read(&name))
        .await
        .map_err(|e| ApiError::Internal(format!("read task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;

    if FileCipher::is_encrypted_file(&path) {
        let actor = Actor::default().with_ip(client_ip(&headers, peer.as_ref()));
        state.audit.log_encryption_action(&actor, "decrypt", &filename);
    }

    let display = UploadStore::display_name(&path);
    let ext = std::path::Path::new(&display)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{display}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(mime_from_extension(ext))),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[derive(Debug, Serialize)]
pub struct SecurityStats {
    pub encryption_enabled: bool,
    pub audit_logging_enabled: bool,
    pub log_directory: String,
    pub upload_directory: String,
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub model_ready: bool,
}

pub async fn security_stats(State(state): State<SharedState>) -> Json<SecurityStats> {
    Json(SecurityStats {
        encryption_enabled: state.store.encrypts(),
        audit_logging_enabled: state.audit.is_enabled(),
        log_directory: state.audit_dir.display().to_string(),
        upload_directory: state.store.dir().display().to_string(),
        max_file_size_mb: state.policy.max_size_mb(),
        allowed_extensions: state.policy.allowed_extensions().to_vec(),
        model_ready: state.service.is_ready(),
    })
}
