//! Medical container decoding port.

use image::RgbImage;

/// Extracts a displayable 8-bit RGB image from a medical imaging container.
pub trait ContainerDecoder: Send + Sync {
    /// Decodes the container bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is malformed, lacks pixel data, or
    /// uses an unsupported encoding.
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<RgbImage>;
}
