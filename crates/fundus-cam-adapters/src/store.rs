//! Upload policy and on-disk upload storage.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{plaintext_path, FileCipher, ENCRYPTED_SUFFIX};

/// Default maximum upload size.
pub const DEFAULT_MAX_SIZE_MB: u64 = 10;
/// Default accepted extensions.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "dcm"];

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Why an upload was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyViolation {
    #[error("invalid filename: '{0}'")]
    InvalidName(String),

    #[error("extension not allowed: '{extension}' (allowed: {})", .allowed.join(", "))]
    Extension {
        extension: String,
        allowed: Vec<String>,
    },

    #[error("file too large: {size_mb:.2}MB (max: {max_mb}MB)")]
    TooLarge { size_mb: f64, max_mb: u64 },
}

/// Size and extension limits applied before anything is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    max_size_bytes: u64,
    allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_SIZE_MB,
            DEFAULT_ALLOWED_EXTENSIONS.iter().map(ToString::to_string).collect(),
        )
    }
}

impl UploadPolicy {
    /// Extensions are compared case-insensitively, without the leading dot.
    #[must_use]
    pub fn new(max_size_mb: u64, allowed_extensions: Vec<String>) -> Self {
        Self {
            max_size_bytes: max_size_mb.saturating_mul(BYTES_PER_MB),
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub const fn max_size_mb(&self) -> u64 {
        self.max_size_bytes / BYTES_PER_MB
    }

    #[must_use]
    pub fn allowed_extensions(&self) -> &[String] {
        &self.allowed_extensions
    }

    /// Validates an upload's name and size.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn check(&self, filename: &str, size_bytes: u64) -> Result<(), PolicyViolation> {
        let name = sanitize_filename(filename)
            .ok_or_else(|| PolicyViolation::InvalidName(filename.to_string()))?;
        let extension = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.allowed_extensions.contains(&extension) {
            return Err(PolicyViolation::Extension {
                extension,
                allowed: self.allowed_extensions.clone(),
            });
        }
        if size_bytes > self.max_size_bytes {
            #[allow(clippy::cast_precision_loss)]
            let size_mb = size_bytes as f64 / BYTES_PER_MB as f64;
            return Err(PolicyViolation::TooLarge {
                size_mb,
                max_mb: self.max_size_mb(),
            });
        }
        Ok(())
    }
}

/// Reduces a client-supplied name to a safe basename.
///
/// Directory components are dropped and characters outside
/// `[A-Za-z0-9._-]` become `_`. Returns `None` when nothing usable remains.
#[must_use]
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        None
    } else {
        Some(cleaned)
    }
}

/// A file written by [`UploadStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredUpload {
    /// Name within the store (with `.encrypted` when sealed).
    pub filename: String,
    pub path: PathBuf,
    pub encrypted: bool,
    /// Size of the original upload.
    pub size_bytes: u64,
}

/// Outcome of [`UploadStore::migrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub already_encrypted: usize,
    pub errors: usize,
}

/// Upload directory with optional encryption at rest.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    cipher: Option<Arc<FileCipher>>,
}

impl UploadStore {
    /// Opens (creating if needed) the upload directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, cipher: Option<Arc<FileCipher>>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create upload directory {}", dir.display()))?;
        Ok(Self { dir, cipher })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True when stored files are encrypted after analysis.
    #[must_use]
    pub const fn encrypts(&self) -> bool {
        self.cipher.is_some()
    }

    /// Writes `bytes` in plaintext under a unique name derived from
    /// `original_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unusable or the write fails.
    pub fn save(&self, original_name: &str, bytes: &[u8]) -> Result<StoredUpload> {
        let base = sanitize_filename(original_name)
            .with_context(|| format!("invalid filename: '{original_name}'"))?;
        let filename = format!("{}_{base}", uuid::Uuid::new_v4().simple());
        let path = self.dir.join(&filename);
        fs::write(&path, bytes).with_context(|| format!("Failed to store {}", path.display()))?;
        debug!("Stored upload {}", path.display());
        Ok(StoredUpload {
            filename,
            path,
            encrypted: false,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Encrypts a stored upload in place when a cipher is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails; the plaintext is then kept.
    pub fn seal(&self, upload: StoredUpload) -> Result<StoredUpload> {
        let Some(cipher) = &self.cipher else {
            return Ok(upload);
        };
        if upload.encrypted {
            return Ok(upload);
        }
        let path = cipher.encrypt_file(&upload.path)?;
        Ok(StoredUpload {
            filename: format!("{}{ENCRYPTED_SUFFIX}", upload.filename),
            path,
            encrypted: true,
            ..upload
        })
    }

    /// Locates a stored file by name, preferring an exact match and falling
    /// back to its encrypted variant. Names with path components never match.
    #[must_use]
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        if sanitize_filename(filename).as_deref() != Some(filename) {
            return None;
        }
        let exact = self.dir.join(filename);
        if exact.is_file() {
            return Some(exact);
        }
        let sealed = self.dir.join(format!("{filename}{ENCRYPTED_SUFFIX}"));
        sealed.is_file().then_some(sealed)
    }

    /// Reads a stored file, decrypting in memory when needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be read, or is
    /// encrypted and no (or the wrong) cipher is configured.
    pub fn read(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self
            .resolve(filename)
            .with_context(|| format!("no stored file named '{filename}'"))?;
        let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        if !FileCipher::is_encrypted_file(&path) {
            return Ok(bytes);
        }
        let cipher = self
            .cipher
            .as_ref()
            .context("file is encrypted but no encryption key is configured")?;
        cipher.decrypt_data(&bytes)
    }

    /// Name a client should see for a resolved path: the plaintext name.
    #[must_use]
    pub fn display_name(path: &Path) -> String {
        let plain = plaintext_path(path).unwrap_or_else(|| path.to_path_buf());
        plain
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Encrypts every plaintext file in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if no cipher is configured or the directory cannot be
    /// listed. Per-file failures are counted, not returned.
    pub fn migrate(&self) -> Result<MigrationReport> {
        let cipher = self
            .cipher
            .as_ref()
            .context("migration requires an encryption key")?;
        let mut report = MigrationReport::default();
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            if FileCipher::is_encrypted_file(&path) {
                report.already_encrypted += 1;
                continue;
            }
            match cipher.encrypt_file(&path) {
                Ok(_) => report.migrated += 1,
                Err(e) => {
                    warn!("Failed to encrypt {}: {e:#}", path.display());
                    report.errors += 1;
                }
            }
        }
        info!(
            "Migration finished: {} encrypted, {} already encrypted, {} errors",
            report.migrated, report.already_encrypted, report.errors
        );
        Ok(report)
    }
}
