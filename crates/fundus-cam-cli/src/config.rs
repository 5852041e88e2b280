//! Configuration file support for fundus-cam.
//!
//! Layers, lowest priority first:
//! - XDG config: `~/.config/fundus-cam/config.toml`
//! - Project-local: `.fundus-cam.toml` (searched up directory tree)
//! - Environment: `ENCRYPTION_KEY`, `ENABLE_AUDIT_LOGS`, `MAX_FILE_SIZE_MB`,
//!   `ALLOWED_IMAGE_EXTENSIONS`, `FUNDUS_CAM_API_KEY`
//! - CLI flags (applied by each command)

use std::path::{Path, PathBuf};
use std::time::Duration;

use fundus_cam_adapters::store::{DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_MAX_SIZE_MB};
use fundus_cam_adapters::UploadPolicy;
use fundus_cam_core::TargetLayer;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Name of the project-local config file.
pub const PROJECT_FILE: &str = ".fundus-cam.toml";

/// Hardcoded fallbacks for unset values.
mod defaults {
    pub const DEVICE: &str = "auto";
    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 8001;
    pub const CORS_ORIGIN: &str = "http://localhost:5173";
    pub const MAX_BODY_MB: u64 = 25;
    pub const TIMEOUT_SECS: u64 = 60;
    pub const AUDIT_DIR: &str = "logs";
    pub const UPLOAD_DIR: &str = "uploaded_images";
    pub const RECORDS_PATH: &str = "analyses.jsonl";
    pub const TTL_MINUTES: u64 = 60;
    pub const CLEANUP_INTERVAL_SECS: u64 = 60;
}

/// Top-level configuration structure.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub model: ModelConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Recurse into subdirectories by default.
    pub recursive: Option<bool>,
}

/// Classifier settings.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Checkpoint path; defaults to the installed default model.
    pub path: Option<PathBuf>,
    /// `auto` or `cpu`.
    pub device: Option<String>,
    /// Attribution layer: `final_conv`, `attention` or `block:N`.
    pub target_layer: Option<String>,
}

/// Batch output settings.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format: "json" or "jsonl".
    pub format: Option<String>,
    /// Pretty-print JSON output.
    pub pretty: Option<bool>,
    /// Show progress bar.
    pub progress: Option<bool>,
    /// Directory for heatmap PNGs.
    pub heatmap_dir: Option<PathBuf>,
}

/// HTTP server settings.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Bearer token required on every route except `/health`.
    pub api_key: Option<String>,
    pub cors_origins: Option<Vec<String>>,
    pub max_body_mb: Option<u64>,
    /// Upper bound for one analysis.
    pub timeout_secs: Option<u64>,
}

/// Encryption, audit and upload policy.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Password for encryption at rest; unset disables encryption.
    pub encryption_key: Option<String>,
    /// Key-derivation salt.
    pub salt: Option<String>,
    pub enable_audit_logs: Option<bool>,
    pub audit_dir: Option<PathBuf>,
    pub max_file_size_mb: Option<u64>,
    pub allowed_extensions: Option<Vec<String>>,
}

/// Upload storage and retention.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: Option<PathBuf>,
    /// Uploads older than this are deleted.
    pub ttl_minutes: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    /// JSON Lines file receiving one row per analysed upload.
    pub records_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from XDG and project-local files and the
    /// environment.
    ///
    /// Missing files are silently ignored. Invalid values are logged as warnings.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(xdg_path) = xdg_config_path() {
            if xdg_path.exists() {
                info!("Loading XDG config: {}", xdg_path.display());
                if let Some(xdg_config) = load_file(&xdg_path) {
                    config = xdg_config;
                }
            } else {
                debug!("XDG config not found: {}", xdg_path.display());
            }
        }

        if let Some(project_path) = find_project_config() {
            info!("Loading project config: {}", project_path.display());
            if let Some(project_config) = load_file(&project_path) {
                config.merge(project_config);
            }
        }

        config.apply_env(|key| std::env::var(key).ok());

        if let Err(e) = config.validate() {
            eprintln!("warning: {e}");
        }

        config
    }

    /// Validate configuration values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref f) = self.output.format {
            if f != "json" && f != "jsonl" {
                return Err(format!("output.format must be 'json' or 'jsonl', got '{f}'"));
            }
        }
        if let Some(ref d) = self.model.device {
            if !d.eq_ignore_ascii_case("auto") && !d.eq_ignore_ascii_case("cpu") {
                return Err(format!("model.device must be 'auto' or 'cpu', got '{d}'"));
            }
        }
        if let Some(ref t) = self.model.target_layer {
            t.parse::<TargetLayer>()
                .map_err(|e| format!("model.target_layer: {e}"))?;
        }
        if self.server.port == Some(0) {
            return Err("server.port must be non-zero".into());
        }
        if self.server.timeout_secs == Some(0) {
            return Err("server.timeout_secs must be at least 1".into());
        }
        if self.server.max_body_mb == Some(0) {
            return Err("server.max_body_mb must be at least 1".into());
        }
        if self.security.max_file_size_mb == Some(0) {
            return Err("security.max_file_size_mb must be at least 1".into());
        }
        if self
            .security
            .allowed_extensions
            .as_ref()
            .is_some_and(|exts| exts.iter().all(|e| e.trim().is_empty()))
        {
            return Err("security.allowed_extensions must not be empty".into());
        }
        if self.security.encryption_key.as_deref() == Some("") {
            return Err("security.encryption_key must not be empty; unset it to disable encryption".into());
        }
        if self.storage.cleanup_interval_secs == Some(0) {
            return Err("storage.cleanup_interval_secs must be at least 1".into());
        }
        Ok(())
    }

    /// Merge another config into this one.
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Self) {
        self.general.recursive = other.general.recursive.or(self.general.recursive);

        self.model.path = other.model.path.or_else(|| self.model.path.take());
        self.model.device = other.model.device.or_else(|| self.model.device.take());
        self.model.target_layer = other.model.target_layer.or_else(|| self.model.target_layer.take());

        self.output.format = other.output.format.or_else(|| self.output.format.take());
        self.output.pretty = other.output.pretty.or(self.output.pretty);
        self.output.progress = other.output.progress.or(self.output.progress);
        self.output.heatmap_dir = other.output.heatmap_dir.or_else(|| self.output.heatmap_dir.take());

        self.server.host = other.server.host.or_else(|| self.server.host.take());
        self.server.port = other.server.port.or(self.server.port);
        self.server.api_key = other.server.api_key.or_else(|| self.server.api_key.take());
        self.server.cors_origins = other.server.cors_origins.or_else(|| self.server.cors_origins.take());
        self.server.max_body_mb = other.server.max_body_mb.or(self.server.max_body_mb);
        self.server.timeout_secs = other.server.timeout_secs.or(self.server.timeout_secs);

        self.security.encryption_key = other
            .security
            .encryption_key
            .or_else(|| self.security.encryption_key.take());
        self.security.salt = other.security.salt.or_else(|| self.security.salt.take());
        self.security.enable_audit_logs = other.security.enable_audit_logs.or(self.security.enable_audit_logs);
        self.security.audit_dir = other.security.audit_dir.or_else(|| self.security.audit_dir.take());
        self.security.max_file_size_mb = other.security.max_file_size_mb.or(self.security.max_file_size_mb);
        self.security.allowed_extensions = other
            .security
            .allowed_extensions
            .or_else(|| self.security.allowed_extensions.take());

        self.storage.upload_dir = other.storage.upload_dir.or_else(|| self.storage.upload_dir.take());
        self.storage.ttl_minutes = other.storage.ttl_minutes.or(self.storage.ttl_minutes);
        self.storage.cleanup_interval_secs = other
            .storage
            .cleanup_interval_secs
            .or(self.storage.cleanup_interval_secs);
        self.storage.records_path = other.storage.records_path.or_else(|| self.storage.records_path.take());
    }

    /// Overlay the security environment variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("FUNDUS_CAM_API_KEY").filter(|k| !k.is_empty()) {
            self.server.api_key = Some(key);
        }
        if let Some(key) = lookup("ENCRYPTION_KEY").filter(|k| !k.is_empty()) {
            self.security.encryption_key = Some(key);
        }
        if let Some(flag) = lookup("ENABLE_AUDIT_LOGS") {
            self.security.enable_audit_logs = Some(flag.trim().eq_ignore_ascii_case("true"));
        }
        if let Some(raw) = lookup("MAX_FILE_SIZE_MB") {
            match raw.trim().parse::<u64>() {
                Ok(mb) => self.security.max_file_size_mb = Some(mb),
                Err(_) => warn!("Ignoring MAX_FILE_SIZE_MB='{raw}': not a whole number"),
            }
        }
        if let Some(raw) = lookup("ALLOWED_IMAGE_EXTENSIONS") {
            self.security.allowed_extensions = Some(raw.split(',').map(|e| e.trim().to_string()).collect());
        }
    }

    /// Resolved checkpoint path, if one is configured or installed.
    pub fn model_path(&self) -> Option<PathBuf> {
        self.model
            .path
            .clone()
            .or_else(|| fundus_cam_adapters::model_path(fundus_cam_adapters::models::DEFAULT_MODEL))
    }

    pub fn device(&self) -> &str {
        self.model.device.as_deref().unwrap_or(defaults::DEVICE)
    }

    /// Attribution layer; an invalid value (already reported by
    /// [`AppConfig::validate`]) falls back to the default.
    pub fn target_layer(&self) -> TargetLayer {
        self.model
            .target_layer
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default()
    }

    pub fn host(&self) -> &str {
        self.server.host.as_deref().unwrap_or(defaults::HOST)
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or(defaults::PORT)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.server
            .cors_origins
            .clone()
            .unwrap_or_else(|| vec![defaults::CORS_ORIGIN.to_string()])
    }

    pub fn max_body_bytes(&self) -> usize {
        let mb = self.server.max_body_mb.unwrap_or(defaults::MAX_BODY_MB);
        usize::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs.unwrap_or(defaults::TIMEOUT_SECS))
    }

    pub fn audit_enabled(&self) -> bool {
        self.security.enable_audit_logs.unwrap_or(true)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.security
            .audit_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::AUDIT_DIR))
    }

    pub fn salt(&self) -> &str {
        self.security
            .salt
            .as_deref()
            .unwrap_or(fundus_cam_adapters::crypto::DEFAULT_SALT)
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        let exts = self.security.allowed_extensions.clone().unwrap_or_else(|| {
            DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect()
        });
        UploadPolicy::new(self.security.max_file_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB), exts)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.storage
            .upload_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::UPLOAD_DIR))
    }

    pub fn records_path(&self) -> PathBuf {
        self.storage
            .records_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::RECORDS_PATH))
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.ttl_minutes.unwrap_or(defaults::TTL_MINUTES) * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(
            self.storage
                .cleanup_interval_secs
                .unwrap_or(defaults::CLEANUP_INTERVAL_SECS),
        )
    }
}

/// Get the XDG config file path.
fn xdg_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("fundus-cam").join("config.toml"))
}

fn find_project_config() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_config_in_parents(&cwd)
}

/// Search for `.fundus-cam.toml` in the given directory and its parents.
fn find_config_in_parents(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_FILE))
        .find(|p| p.exists())
}

/// Load and parse a TOML config file.
fn load_file(path: &Path) -> Option<AppConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return None;
        }
    };

    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Failed to parse config file {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.model.path.is_none());
        assert_eq!(config.port(), 8001);
        assert_eq!(config.host(), "127.0.0.1");
        assert_eq!(config.target_layer(), TargetLayer::FinalConv);
        assert_eq!(config.analysis_timeout(), Duration::from_secs(60));
        assert!(config.audit_enabled());
        assert_eq!(config.cors_origins(), vec!["http://localhost:5173".to_string()]);
        assert_eq!(config.upload_policy().max_size_mb(), 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: AppConfig = toml::from_str("").expect("parse empty config");
        assert!(config.server.port.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r"
[general]
recursive = true

[model]
path = '/srv/models/glaucoma.safetensors'
device = 'cpu'
target_layer = 'attention'

[output]
format = 'json'
pretty = true
progress = false
heatmap_dir = 'heatmaps'

[server]
host = '0.0.0.0'
port = 9000
api_key = 'secret'
cors_origins = ['https://clinic.example']
max_body_mb = 12
timeout_secs = 30

[security]
encryption_key = 'hunter2'
salt = 'site_salt'
enable_audit_logs = false
audit_dir = '/var/log/fundus'
max_file_size_mb = 5
allowed_extensions = ['png', 'dcm']

[storage]
upload_dir = '/srv/uploads'
ttl_minutes = 30
cleanup_interval_secs = 15
records_path = '/srv/analyses.jsonl'
";
        let config: AppConfig = toml::from_str(toml).expect("parse full config");
        assert!(config.validate().is_ok());

        assert_eq!(config.general.recursive, Some(true));
        assert_eq!(config.device(), "cpu");
        assert_eq!(config.target_layer(), TargetLayer::Attention);
        assert_eq!(config.output.format.as_deref(), Some("json"));
        assert_eq!(config.host(), "0.0.0.0");
        assert_eq!(config.port(), 9000);
        assert_eq!(config.max_body_bytes(), 12 * 1024 * 1024);
        assert_eq!(config.analysis_timeout(), Duration::from_secs(30));
        assert!(!config.audit_enabled());
        assert_eq!(config.salt(), "site_salt");
        assert_eq!(config.upload_policy().allowed_extensions(), ["png", "dcm"]);
        assert_eq!(config.upload_ttl(), Duration::from_secs(30 * 60));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(15));
        assert_eq!(config.model_path(), Some(PathBuf::from("/srv/models/glaucoma.safetensors")));
    }

    #[test]
    fn test_merge_preserves_base_when_override_is_none() {
        let mut base: AppConfig = toml::from_str(
            r"
[server]
port = 9000
host = '0.0.0.0'

[storage]
ttl_minutes = 10
",
        )
        .expect("parse base");

        let override_config: AppConfig = toml::from_str(
            r"
[server]
port = 9100

[security]
max_file_size_mb = 3
",
        )
        .expect("parse override");

        base.merge(override_config);

        assert_eq!(base.server.port, Some(9100));
        assert_eq!(base.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(base.storage.ttl_minutes, Some(10));
        assert_eq!(base.security.max_file_size_mb, Some(3));
    }

    #[test]
    fn test_merge_all_sections() {
        let mut base = AppConfig::default();
        let other: AppConfig = toml::from_str(
            r"
[general]
recursive = true
[model]
device = 'cpu'
[output]
pretty = true
[server]
api_key = 'k'
[security]
enable_audit_logs = false
[storage]
upload_dir = 'up'
",
        )
        .expect("parse other");
        base.merge(other);
        assert_eq!(base.general.recursive, Some(true));
        assert_eq!(base.model.device.as_deref(), Some("cpu"));
        assert_eq!(base.output.pretty, Some(true));
        assert_eq!(base.server.api_key.as_deref(), Some("k"));
        assert_eq!(base.security.enable_audit_logs, Some(false));
        assert_eq!(base.upload_dir(), PathBuf::from("up"));
    }

    #[test]
    fn test_env_overrides_files() {
        let mut config: AppConfig = toml::from_str(
            r"
[security]
encryption_key = 'from-file'
enable_audit_logs = true
max_file_size_mb = 10
",
        )
        .expect("parse");
        config.apply_env(env(&[
            ("ENCRYPTION_KEY", "from-env"),
            ("ENABLE_AUDIT_LOGS", "False"),
            ("MAX_FILE_SIZE_MB", "4"),
            ("ALLOWED_IMAGE_EXTENSIONS", "jpg, png"),
            ("FUNDUS_CAM_API_KEY", "token"),
        ]));
        assert_eq!(config.security.encryption_key.as_deref(), Some("from-env"));
        assert_eq!(config.server.api_key.as_deref(), Some("token"));
        assert!(!config.audit_enabled());
        let policy = config.upload_policy();
        assert_eq!(policy.max_size_mb(), 4);
        assert_eq!(policy.allowed_extensions(), ["jpg", "png"]);
    }

    #[test]
    fn test_env_ignores_garbage() {
        let mut config = AppConfig::default();
        config.apply_env(env(&[("MAX_FILE_SIZE_MB", "ten"), ("ENCRYPTION_KEY", "")]));
        assert!(config.security.max_file_size_mb.is_none());
        assert!(config.security.encryption_key.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            ("[output]\nformat = 'xml'", "output.format"),
            ("[model]\ndevice = 'tpu'", "model.device"),
            ("[model]\ntarget_layer = 'head'", "model.target_layer"),
            ("[server]\ntimeout_secs = 0", "server.timeout_secs"),
            ("[security]\nmax_file_size_mb = 0", "security.max_file_size_mb"),
            ("[security]\nallowed_extensions = []", "security.allowed_extensions"),
            ("[security]\nencryption_key = ''", "security.encryption_key"),
        ];
        for (toml, field) in cases {
            let config: AppConfig = toml::from_str(toml).expect("parse");
            let err = config.validate().expect_err(field);
            assert!(err.contains(field), "{err}");
        }
    }

    #[test]
    fn test_find_config_in_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(!find_config_in_parents(&nested).is_some_and(|p| p.starts_with(dir.path())));

        let config_path = dir.path().join("a").join(PROJECT_FILE);
        std::fs::write(&config_path, "[server]\nport = 9999\n").unwrap();
        assert_eq!(find_config_in_parents(&nested), Some(config_path.clone()));
        assert_eq!(load_file(&config_path).unwrap().port(), 9999);
    }

    #[test]
    fn test_load_file_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROJECT_FILE);
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(load_file(&path).is_none());
    }
}
