//! Uploaded image types.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// MIME type of the medical-imaging container accepted next to raster images.
pub const DICOM_MIME: &str = "application/dicom";

/// Raw uploaded bytes together with their declared content type.
///
/// Consumed by preprocessing and never retained afterwards.
#[derive(Debug, Clone)]
pub struct RawImage<'a> {
    /// Encoded image bytes, exactly as received.
    pub bytes: Cow<'a, [u8]>,
    /// Declared MIME type (e.g. `image/png`).
    pub mime_type: String,
}

impl<'a> RawImage<'a> {
    /// Wraps borrowed bytes.
    #[must_use]
    pub fn new(bytes: &'a [u8], mime_type: impl Into<String>) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Wraps owned bytes.
    #[must_use]
    pub fn owned(bytes: Vec<u8>, mime_type: impl Into<String>) -> RawImage<'static> {
        RawImage {
            bytes: Cow::Owned(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Returns true if the declared type is accepted by the analyze contract.
    ///
    /// Any `image/*` type qualifies, as does the DICOM container type.
    #[must_use]
    pub fn has_image_mime(&self) -> bool {
        let mime = self.essence();
        mime.starts_with("image/") || mime == DICOM_MIME
    }

    /// Returns true if the bytes should go through the medical container decoder.
    #[must_use]
    pub fn is_dicom(&self) -> bool {
        self.essence() == DICOM_MIME || has_dicom_magic(&self.bytes)
    }

    /// MIME type lowercased and stripped of parameters (`; charset=...`).
    fn essence(&self) -> String {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// An image read from disk for batch analysis.
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Where the bytes came from.
    pub path: PathBuf,
    /// The file contents with a MIME type guessed from the extension.
    pub raw: RawImage<'static>,
}

impl SourceImage {
    /// Wraps file contents, guessing the MIME type from `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>, bytes: Vec<u8>) -> Self {
        let path = path.as_ref();
        let mime = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or("application/octet-stream", mime_from_extension);
        Self {
            path: path.to_path_buf(),
            raw: RawImage::owned(bytes, mime),
        }
    }
}

/// DICOM part 10 files carry `DICM` right after a 128-byte preamble.
#[must_use]
pub fn has_dicom_magic(bytes: &[u8]) -> bool {
    bytes.get(128..132) == Some(b"DICM".as_slice())
}

/// Guesses a MIME type from a file extension, for callers reading from disk.
#[must_use]
pub fn mime_from_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "dcm" | "dicom" => DICOM_MIME,
        _ => "application/octet-stream",
    }
}
