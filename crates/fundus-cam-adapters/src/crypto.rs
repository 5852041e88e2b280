//! Encryption at rest for stored uploads.
//!
//! Files are sealed with Fernet (AES-128-CBC + HMAC-SHA256). The Fernet key is
//! derived from a password with PBKDF2-HMAC-SHA256, so any process holding
//! the same password and salt can read files written by another.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use fernet::Fernet;
use sha2::Sha256;
use tracing::{error, info};

/// Suffix appended to encrypted files.
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

/// Salt used when none is configured. Matches files written by earlier
/// deployments of the gateway.
pub const DEFAULT_SALT: &str = "glaucoma_salt_2024";

/// PBKDF2 iteration count.
pub const KDF_ITERATIONS: u32 = 100_000;

/// Password-derived Fernet cipher.
pub struct FileCipher {
    fernet: Fernet,
}

impl fmt::Debug for FileCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCipher").finish_non_exhaustive()
    }
}

impl FileCipher {
    /// Derives the cipher key from `password` and `salt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the password is empty.
    pub fn from_password(password: &str, salt: &str) -> Result<Self> {
        if password.is_empty() {
            anyhow::bail!("encryption password must not be empty");
        }
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), KDF_ITERATIONS, &mut key);
        let fernet = Fernet::new(&URL_SAFE.encode(key))
            .ok_or_else(|| anyhow!("derived key was rejected by Fernet"))?;
        Ok(Self { fernet })
    }

    /// Encrypts bytes in memory, returning the Fernet token.
    #[must_use]
    pub fn encrypt_data(&self, data: &[u8]) -> Vec<u8> {
        self.fernet.encrypt(data).into_bytes()
    }

    /// Decrypts a Fernet token produced by [`Self::encrypt_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, was written with another
    /// key, or fails authentication.
    pub fn decrypt_data(&self, token: &[u8]) -> Result<Vec<u8>> {
        let token = std::str::from_utf8(token).context("token is not valid UTF-8")?;
        self.fernet
            .decrypt(token.trim())
            .map_err(|_| anyhow!("decryption failed: wrong key or corrupted data"))
    }

    /// Encrypts `path` to `<path>.encrypted` and removes the plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if reading, writing or removing fails.
    pub fn encrypt_file(&self, path: &Path) -> Result<PathBuf> {
        let result = self.encrypt_file_inner(path);
        if let Err(e) = &result {
            error!("Failed to encrypt {}: {e:#}", path.display());
        }
        result
    }

    fn encrypt_file_inner(&self, path: &Path) -> Result<PathBuf> {
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let encrypted = encrypted_path(path);
        fs::write(&encrypted, self.encrypt_data(&data))
            .with_context(|| format!("Failed to write {}", encrypted.display()))?;
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        info!("Encrypted {} -> {}", path.display(), encrypted.display());
        Ok(encrypted)
    }

    /// Decrypts `encrypted` into `output`, or next to it with the suffix
    /// stripped when no output is given. The encrypted file is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or decrypted, if no output
    /// is given and the name lacks the `.encrypted` suffix, or if writing fails.
    pub fn decrypt_file(&self, encrypted: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let result = self.decrypt_file_inner(encrypted, output);
        if let Err(e) = &result {
            error!("Failed to decrypt {}: {e:#}", encrypted.display());
        }
        result
    }

    fn decrypt_file_inner(&self, encrypted: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let output = match output {
            Some(p) => p.to_path_buf(),
            None => plaintext_path(encrypted).with_context(|| {
                format!("{} has no {ENCRYPTED_SUFFIX} suffix", encrypted.display())
            })?,
        };
        let token =
            fs::read(encrypted).with_context(|| format!("Failed to read {}", encrypted.display()))?;
        let data = self.decrypt_data(&token)?;
        fs::write(&output, data).with_context(|| format!("Failed to write {}", output.display()))?;
        info!("Decrypted {} -> {}", encrypted.display(), output.display());
        Ok(output)
    }

    /// True if `path` carries the `.encrypted` suffix.
    #[must_use]
    pub fn is_encrypted_file(path: &Path) -> bool {
        path.to_string_lossy().ends_with(ENCRYPTED_SUFFIX)
    }
}

/// `<path>.encrypted`.
#[must_use]
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(ENCRYPTED_SUFFIX);
    PathBuf::from(s)
}

/// `path` without its `.encrypted` suffix, if it has one.
#[must_use]
pub fn plaintext_path(path: &Path) -> Option<PathBuf> {
    path.to_str()
        .and_then(|s| s.strip_suffix(ENCRYPTED_SUFFIX))
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cipher(password: &str) -> FileCipher {
        FileCipher::from_password(password, DEFAULT_SALT).unwrap()
    }

    #[test]
    fn test_data_round_trip() {
        let c = cipher("s3cret");
        let token = c.encrypt_data(b"fundus pixels");
        assert_ne!(token, b"fundus pixels");
        assert_eq!(c.decrypt_data(&token).unwrap(), b"fundus pixels");
    }

    #[test]
    fn test_same_password_reads_across_instances() {
        let token = cipher("shared").encrypt_data(b"x");
        assert_eq!(cipher("shared").decrypt_data(&token).unwrap(), b"x");
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = cipher("right").encrypt_data(b"x");
        assert!(cipher("wrong").decrypt_data(&token).is_err());
    }

    #[test]
    fn test_other_salt_fails() {
        let token = cipher("pw").encrypt_data(b"x");
        let other = FileCipher::from_password("pw", "another_salt").unwrap();
        assert!(other.decrypt_data(&token).is_err());
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(FileCipher::from_password("", DEFAULT_SALT).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("eye.png");
        fs::write(&plain, b"png bytes").unwrap();

        let c = cipher("pw");
        let enc = c.encrypt_file(&plain).unwrap();
        assert_eq!(enc, dir.path().join("eye.png.encrypted"));
        assert!(!plain.exists());
        assert!(FileCipher::is_encrypted_file(&enc));

        let out = c.decrypt_file(&enc, None).unwrap();
        assert_eq!(out, plain);
        assert_eq!(fs::read(&out).unwrap(), b"png bytes");
        assert!(enc.exists());
    }

    #[test]
    fn test_decrypt_to_explicit_output() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.jpg");
        fs::write(&plain, b"jpeg").unwrap();
        let c = cipher("pw");
        let enc = c.encrypt_file(&plain).unwrap();
        let target = dir.path().join("a.jpg.temp_7");
        assert_eq!(c.decrypt_file(&enc, Some(&target)).unwrap(), target);
        assert_eq!(fs::read(&target).unwrap(), b"jpeg");
    }

    #[test]
    fn test_decrypt_without_suffix_needs_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.bin");
        fs::write(&path, cipher("pw").encrypt_data(b"x")).unwrap();
        assert!(cipher("pw").decrypt_file(&path, None).is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(
            plaintext_path(Path::new("/u/eye.png.encrypted")),
            Some(PathBuf::from("/u/eye.png"))
        );
        assert_eq!(plaintext_path(Path::new("/u/eye.png")), None);
        assert!(!FileCipher::is_encrypted_file(Path::new("eye.png")));
    }
}
