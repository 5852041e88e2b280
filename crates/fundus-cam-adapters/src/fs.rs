//! Filesystem adapter for loading fundus images.

use anyhow::{Context, Result};
use fundus_cam_core::{ImageSource, SourceImage};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extensions decoded by the raster path.
const RASTER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tiff", "tif", "webp", "bmp", "gif"];
/// Extensions routed through the DICOM decoder.
const DICOM_EXTENSIONS: &[&str] = &["dcm", "dicom"];

/// Filesystem image source adapter.
///
/// Files are read lazily, one per iteration step, so a large batch never
/// holds more than one encoded image in memory.
pub struct FsImageSource {
    paths: Vec<PathBuf>,
    recursive: bool,
}

impl FsImageSource {
    /// Creates a new filesystem image source.
    ///
    /// # Arguments
    ///
    /// * `paths` - Files or directories to scan
    /// * `recursive` - Whether to recurse into subdirectories
    #[must_use]
    pub const fn new(paths: Vec<PathBuf>, recursive: bool) -> Self {
        Self { paths, recursive }
    }

    /// Collects all supported files, sorted within each directory.
    fn collect_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for path in &self.paths {
            if path.is_file() {
                if is_supported_image(path) {
                    files.push(path.clone());
                } else {
                    warn!("Unsupported file type: {}", path.display());
                }
            } else if path.is_dir() {
                self.collect_from_dir(path, &mut files);
            } else {
                warn!("Path does not exist: {}", path.display());
            }
        }

        files
    }

    fn collect_from_dir(&self, dir: &Path, files: &mut Vec<PathBuf>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to read directory {}: {e}", dir.display());
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();

        for path in paths {
            if path.is_file() && is_supported_image(&path) {
                files.push(path);
            } else if path.is_dir() && self.recursive {
                self.collect_from_dir(&path, files);
            }
        }
    }
}

impl ImageSource for FsImageSource {
    fn images(&self) -> Box<dyn Iterator<Item = Result<SourceImage>> + Send + '_> {
        let files = self.collect_files();
        debug!("Found {} image files", files.len());

        Box::new(files.into_iter().map(|path| read_image(&path)))
    }

    fn count_hint(&self) -> Option<usize> {
        Some(self.collect_files().len())
    }
}

/// Checks if a path has a supported image extension.
fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .is_some_and(|e| {
            RASTER_EXTENSIONS.contains(&e.as_str()) || DICOM_EXTENSIONS.contains(&e.as_str())
        })
}

/// Reads a file's bytes; decoding happens later in the pipeline.
fn read_image(path: &Path) -> Result<SourceImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))?;
    Ok(SourceImage::new(path, bytes))
}
