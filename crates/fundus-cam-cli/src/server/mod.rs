//! HTTP gateway.
//!
//! Endpoints:
//! - GET  /health           - liveness and model status
//! - POST /analyze/         - classify an image, JSON report with inline heatmap
//! - POST /heatmap/         - classify an image, raw PNG composite
//! - POST /uploadfile/      - store, analyse, record and encrypt an upload
//! - GET  /files/:filename  - download a stored upload, decrypting on demand
//! - GET  /security/stats   - encryption, audit and upload policy settings

mod error;
mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use fundus_cam_adapters::{UploadPolicy, UploadStore};
use fundus_cam_core::{AuditSink, InferenceService, RecordSink};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use error::{ApiError, ErrorBody};

/// Everything a request handler needs. Immutable after startup.
pub struct ServerState {
    pub service: InferenceService,
    pub store: UploadStore,
    pub policy: UploadPolicy,
    pub audit: Arc<dyn AuditSink>,
    /// Reported by `/security/stats`.
    pub audit_dir: PathBuf,
    pub records: Arc<dyn RecordSink>,
    /// Bearer token guarding every route but `/health`.
    pub api_key: Option<String>,
    /// Upper bound for one analysis.
    pub timeout: Duration,
    pub started: Instant,
}

pub type SharedState = Arc<ServerState>;

/// Build the axum router with all endpoints.
pub fn router(state: SharedState, cors_origins: &[String], max_body_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/analyze/", post(handlers::analyze))
        .route("/heatmap/", post(handlers::heatmap))
        .route("/uploadfile/", post(handlers::upload_file))
        .route("/files/:filename", get(handlers::download_file))
        .route("/security/stats", get(handlers::security_stats))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_api_key));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{o}'");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

async fn require_api_key(State(state): State<SharedState>, request: Request, next: Next) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Binds `addr` and serves until `shutdown` resolves.
pub async fn serve<F>(app: Router, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutting down");
}
