//! Checkpoint downloading and caching adapter.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Checkpoint metadata.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Model name/identifier.
    pub name: &'static str,
    /// Filename in the models directory.
    pub filename: &'static str,
    /// One-line description for `models list`.
    pub description: &'static str,
}

/// Name of the checkpoint loaded when none is configured.
pub const DEFAULT_MODEL: &str = "glaucoma-mobilenetv3";

/// Known checkpoints.
///
/// Weights are distributed by the deploying site, so the registry carries no
/// URLs; `models fetch` takes the URL and expected digest as arguments.
pub const MODELS: &[ModelInfo] = &[ModelInfo {
    name: DEFAULT_MODEL,
    filename: "glaucoma_mobilenetv3.safetensors",
    description: "MobileNetV3-Large + spatial attention, 2-class glaucoma screening",
}];

/// Download progress: model name, bytes so far, total if known.
pub type ProgressCallback = Box<dyn Fn(&str, u64, Option<u64>) + Send + Sync>;

/// Returns the models directory path.
///
/// Uses `XDG_DATA_HOME/fundus-cam/models` or `~/.local/share/fundus-cam/models`.
#[must_use]
pub fn models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fundus-cam")
        .join("models")
}

/// Returns the path to a specific checkpoint file.
#[must_use]
pub fn model_path(name: &str) -> Option<PathBuf> {
    find(name).map(|m| models_dir().join(m.filename))
}

/// Lists known checkpoints with their install status.
#[must_use]
pub fn list_models() -> Vec<(String, bool)> {
    let dir = models_dir();
    MODELS
        .iter()
        .map(|m| (m.name.to_string(), dir.join(m.filename).exists()))
        .collect()
}

fn find(name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.name == name)
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Fails unless `bytes` hash to `expected` (case-insensitive hex).
fn verify_checksum(name: &str, bytes: &[u8], expected: Option<&str>, dest: &Path) -> Result<()> {
    let Some(expected) = expected else {
        debug!("No checksum given for {name}, skipping verification");
        return Ok(());
    };
    let hash = sha256_hex(bytes);
    if !hash.eq_ignore_ascii_case(expected) {
        anyhow::bail!(
            "Checksum mismatch for {name}: expected {expected}, got {hash}. \
             Try deleting {} and re-running to fetch a fresh copy.",
            dest.display()
        );
    }
    Ok(())
}

/// Writes `bytes` next to `dest` and renames into place.
fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context("Failed to create models directory")?;
    }
    let partial = dest.with_extension("part");
    fs::write(&partial, bytes).with_context(|| format!("Failed to write {}", partial.display()))?;
    fs::rename(&partial, dest).with_context(|| format!("Failed to move {} into place", dest.display()))?;
    Ok(())
}

/// Downloads the checkpoint `name` from `url` into the models directory.
///
/// # Errors
///
/// Returns an error if:
/// - The model name is unknown
/// - The download fails or returns a non-success status
/// - The checksum doesn't match `expected_sha256`
/// - The file cannot be written
pub fn download_model(
    name: &str,
    url: &str,
    expected_sha256: Option<&str>,
    progress: Option<&ProgressCallback>,
) -> Result<PathBuf> {
    let model = find(name).with_context(|| format!("Unknown model: {name}"))?;
    let dest = models_dir().join(model.filename);
    info!("Downloading model: {name}");

    let mut response =
        reqwest::blocking::get(url).with_context(|| format!("Failed to download {name}"))?;
    if !response.status().is_success() {
        anyhow::bail!("Download failed with status: {}", response.status());
    }

    let total = response.content_length();
    let mut bytes = Vec::with_capacity(total.and_then(|t| usize::try_from(t).ok()).unwrap_or(0));
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = response
            .read(&mut chunk)
            .with_context(|| format!("Failed to read response for {name}"))?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
        if let Some(cb) = progress {
            cb(name, bytes.len() as u64, total);
        }
    }

    verify_checksum(name, &bytes, expected_sha256, &dest)?;
    write_atomically(&dest, &bytes)?;

    info!("Downloaded {name} ({} bytes)", bytes.len());
    Ok(dest)
}

/// Copies a local checkpoint file into the models directory.
///
/// # Errors
///
/// Returns an error if the model name is unknown, the source cannot be read,
/// or the checksum doesn't match.
pub fn install_model(name: &str, source: &Path, expected_sha256: Option<&str>) -> Result<PathBuf> {
    let model = find(name).with_context(|| format!("Unknown model: {name}"))?;
    let dest = models_dir().join(model.filename);
    let bytes = fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
    verify_checksum(name, &bytes, expected_sha256, &dest)?;
    write_atomically(&dest, &bytes)?;
    info!("Installed {name} from {}", source.display());
    Ok(dest)
}
