//! Synthetic image builders for testing.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};

/// Builder for creating synthetic test images.
///
/// Images are deterministic so that pipeline outputs can be compared
/// across runs.
pub struct SyntheticImageBuilder;

impl SyntheticImageBuilder {
    /// A single-color image.
    #[must_use]
    pub fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    /// A dark solid image with a bright annulus around the center.
    #[must_use]
    pub fn bright_ring(width: u32, height: u32) -> RgbImage {
        let cx = width as f32 / 2.0;
        let cy = height as f32 / 2.0;
        let outer = width.min(height) as f32 * 0.3;
        let inner = outer * 0.7;
        RgbImage::from_fn(width, height, |x, y| {
            let d = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
            if d >= inner && d <= outer {
                Rgb([250, 240, 200])
            } else {
                Rgb([40, 20, 10])
            }
        })
    }

    /// A fundus-like image: black surround, orange retina, and a bright optic
    /// disc off to one side.
    #[must_use]
    pub fn fundus(width: u32, height: u32) -> RgbImage {
        let cx = width as f32 / 2.0;
        let cy = height as f32 / 2.0;
        let radius = width.min(height) as f32 * 0.45;
        let disc_x = cx + radius * 0.45;
        let disc_r = radius * 0.15;
        RgbImage::from_fn(width, height, |x, y| {
            let (fx, fy) = (x as f32, y as f32);
            let d = ((fx - cx).powi(2) + (fy - cy).powi(2)).sqrt();
            if d > radius {
                return Rgb([0, 0, 0]);
            }
            let disc = ((fx - disc_x).powi(2) + (fy - cy).powi(2)).sqrt();
            if disc < disc_r {
                Rgb([255, 230, 170])
            } else {
                let shade = 1.0 - 0.4 * d / radius;
                Rgb([(200.0 * shade) as u8, (90.0 * shade) as u8, (30.0 * shade) as u8])
            }
        })
    }

    /// A diagonal color gradient.
    #[must_use]
    pub fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x * 255) / width.max(1)) as u8,
                ((y * 255) / height.max(1)) as u8,
                (((x + y) * 127) / (width + height).max(1)) as u8,
            ])
        })
    }

    /// Encodes as PNG.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails, which does not happen for in-memory buffers.
    #[must_use]
    pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
        Self::encode(img, ImageFormat::Png)
    }

    /// Encodes as JPEG.
    ///
    /// # Panics
    ///
    /// Panics if encoding fails, which does not happen for in-memory buffers.
    #[must_use]
    pub fn jpeg_bytes(img: &RgbImage) -> Vec<u8> {
        Self::encode(img, ImageFormat::Jpeg)
    }

    #[allow(clippy::panic)]
    fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format)
            .unwrap_or_else(|e| panic!("encoding a synthetic image failed: {e}"));
        buf.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bright_ring_has_ring() {
        let img = SyntheticImageBuilder::bright_ring(512, 512);
        assert_eq!(img.get_pixel(256, 256), &Rgb([40, 20, 10]));
        // Radius 0.85 * 0.3 * 512 lies inside the annulus.
        let r = (512.0 * 0.3 * 0.85) as u32;
        assert_eq!(img.get_pixel(256 + r, 256), &Rgb([250, 240, 200]));
    }

    #[test]
    fn test_encoders_produce_decodable_bytes() {
        let img = SyntheticImageBuilder::fundus(64, 48);
        for bytes in [SyntheticImageBuilder::png_bytes(&img), SyntheticImageBuilder::jpeg_bytes(&img)] {
            let decoded = image::load_from_memory(&bytes).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!((decoded.width(), decoded.height()), (64, 48));
        }
    }
}
