//! Serve command - run the HTTP gateway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use fundus_cam_adapters::{run_cleanup_loop, DicomDecoder, FileAuditLog, JsonlRecordSink, UploadStore};
use fundus_cam_core::inference::device_for;
use fundus_cam_core::{AuditSink, InferenceService, RecordSink, TargetLayer};
use tracing::{info, warn};

use super::analyze::parse_target_layer;
use super::vault::cipher_from_config;
use crate::config::AppConfig;
use crate::server::{self, ServerState};

#[derive(Args, Clone, Default)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Classifier checkpoint (overrides config and the installed default)
    #[arg(long, value_name = "FILE")]
    pub model: Option<PathBuf>,

    /// Inference device: auto or cpu
    #[arg(long)]
    pub device: Option<String>,

    /// Attribution layer: final_conv, attention or block:N
    #[arg(long, value_parser = parse_target_layer)]
    pub target_layer: Option<TargetLayer>,

    /// Require `Authorization: Bearer <KEY>` on every route but /health
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,
}

/// Loads the classifier, or an unavailable service that answers 503.
fn build_service(args: &ServeArgs, config: &AppConfig) -> InferenceService {
    let service = match args.model.clone().or_else(|| config.model_path()) {
        Some(path) if path.exists() => {
            let device = device_for(args.device.as_deref().unwrap_or_else(|| config.device()));
            let target = args.target_layer.unwrap_or_else(|| config.target_layer());
            InferenceService::load(&path, &device, target)
        }
        Some(path) => InferenceService::unavailable(format!("checkpoint {} not found", path.display())),
        None => InferenceService::unavailable("no classifier checkpoint configured"),
    };
    if let Some(reason) = service.unavailable_reason() {
        warn!("Serving without a classifier: {reason}");
    }
    service.with_container_decoder(Arc::new(DicomDecoder))
}

pub fn run(args: &ServeArgs, config: &AppConfig) -> Result<()> {
    let host = args.host.as_deref().unwrap_or_else(|| config.host());
    let port = args.port.unwrap_or_else(|| config.port());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;

    let cipher = cipher_from_config(config)?.map(Arc::new);
    if cipher.is_none() {
        warn!("No encryption key configured; uploads are stored in plaintext");
    }
    let upload_dir = config.upload_dir();
    let store = UploadStore::new(&upload_dir, cipher)?;
    let audit_dir = config.audit_dir();
    let audit: Arc<dyn AuditSink> = Arc::new(FileAuditLog::new(&audit_dir, config.audit_enabled())?);
    let records: Arc<dyn RecordSink> = Arc::new(JsonlRecordSink::new(config.records_path())?);

    let state = Arc::new(ServerState {
        service: build_service(args, config),
        store,
        policy: config.upload_policy(),
        audit,
        audit_dir,
        records,
        api_key: args.api_key.clone().or_else(|| config.server.api_key.clone()),
        timeout: config.analysis_timeout(),
        started: Instant::now(),
    });
    if state.api_key.is_none() {
        info!("No API key configured; endpoints are open");
    }
    let app = server::router(state, &config.cors_origins(), config.max_body_bytes());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        let janitor = tokio::spawn(run_cleanup_loop(
            upload_dir,
            config.upload_ttl(),
            config.cleanup_interval(),
            async move {
                let _ = stop_rx.wait_for(|stop| *stop).await;
            },
        ));

        let served = server::serve(app, addr, server::shutdown_signal()).await;

        let _ = stop_tx.send(true);
        if let Err(e) = janitor.await {
            warn!("Cleanup task ended abnormally: {e}");
        }
        served
    })
}
