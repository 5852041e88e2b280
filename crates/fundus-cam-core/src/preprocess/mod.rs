//! Image preprocessing: decode, contrast enhancement, denoise, resize, normalize.
//!
//! Produces the `[1, 3, 224, 224]` network input. Every step is a pure
//! function of its input, so identical bytes yield identical tensors.

#![allow(clippy::cast_precision_loss)]

mod clahe;
mod color;

pub use clahe::Clahe;
pub use color::{lab_to_rgb, rgb_to_lab, LabImage};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;

use crate::error::AnalyzeError;

/// Side length of the square network input.
pub const INPUT_SIZE: u32 = 224;

/// ImageNet channel means.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Median filter radius (5x5 kernel).
const MEDIAN_RADIUS: u32 = 2;

/// A normalized `[1, 3, 224, 224]` input tensor.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    tensor: Tensor,
}

impl PreprocessedImage {
    /// The network input.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Consumes the wrapper.
    #[must_use]
    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }
}

/// Decodes raster bytes (PNG, JPEG, BMP, TIFF, ...) to 8-bit RGB.
///
/// Alpha is dropped; grayscale is expanded to three channels.
///
/// # Errors
///
/// Returns [`AnalyzeError::Decode`] for empty or undecodable bytes.
pub fn decode_raster(bytes: &[u8]) -> Result<RgbImage, AnalyzeError> {
    if bytes.is_empty() {
        return Err(AnalyzeError::Decode("empty image data".into()));
    }
    let img = image::load_from_memory(bytes).map_err(|e| AnalyzeError::Decode(e.to_string()))?;
    if img.width() == 0 || img.height() == 0 {
        return Err(AnalyzeError::Decode("image has zero size".into()));
    }
    Ok(img.to_rgb8())
}

/// Applies CLAHE to the lightness channel and a 5x5 median filter.
#[must_use]
pub fn enhance(rgb: &RgbImage) -> RgbImage {
    let mut lab = LabImage::from_rgb(rgb);
    lab.l = Clahe::default().apply(&lab.l, lab.width as usize, lab.height as usize);
    let equalized = lab.to_rgb();
    imageproc::filter::median_filter(&equalized, MEDIAN_RADIUS, MEDIAN_RADIUS)
}

/// Resizes to the network resolution and normalizes into an NCHW tensor.
///
/// # Errors
///
/// Returns an error if the tensor cannot be created on `device`.
pub fn to_input_tensor(rgb: &RgbImage, device: &Device) -> candle_core::Result<PreprocessedImage> {
    let resized = image::imageops::resize(rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, px) in resized.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (f32::from(px[c]) / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    let size = INPUT_SIZE as usize;
    let tensor = Tensor::from_vec(data, (1, 3, size, size), device)?;
    Ok(PreprocessedImage { tensor })
}

/// Runs enhancement and normalization on an already decoded image.
///
/// # Errors
///
/// Returns an error if the tensor cannot be created on `device`.
pub fn preprocess(rgb: &RgbImage, device: &Device) -> candle_core::Result<PreprocessedImage> {
    to_input_tensor(&enhance(rgb), device)
}
