//! Importance maps produced by the attribution engine.

use std::fmt;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

/// Guard added to the normalization denominator.
pub const NORMALIZATION_EPSILON: f32 = 1e-7;

/// Attribution algorithm that produced a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethod {
    /// Gradient-weighted class activation mapping.
    GradCam,
    /// Second-order weighted variant of Grad-CAM.
    GradCamPlusPlus,
}

impl AttributionMethod {
    /// Panel title used by the renderer.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::GradCam => "GRAD-CAM",
            Self::GradCamPlusPlus => "GRAD-CAM++",
        }
    }
}

impl fmt::Display for AttributionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GradCam => f.write_str("grad_cam"),
            Self::GradCamPlusPlus => f.write_str("grad_cam_plus_plus"),
        }
    }
}

/// Single-channel spatial importance grid with values in `[0, 1]`.
///
/// Row-major, at the resolution of the attribution layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceMap {
    method: AttributionMethod,
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl ImportanceMap {
    /// Builds a map from raw (already ReLU-clipped) scores, normalizing them.
    ///
    /// Normalization is `(x - min) / (max' + eps)` where `max'` is the maximum
    /// after subtracting the minimum. A constant input yields an all-zero map.
    ///
    /// Returns `None` when `raw` does not hold `width * height` values or any
    /// value is not finite.
    #[must_use]
    pub fn normalized(
        method: AttributionMethod,
        width: usize,
        height: usize,
        raw: Vec<f32>,
    ) -> Option<Self> {
        if raw.len() != width * height || raw.is_empty() || raw.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let min = raw.iter().copied().fold(f32::INFINITY, f32::min);
        let mut values = raw;
        for v in &mut values {
            *v -= min;
        }
        let max = values.iter().copied().fold(0.0f32, f32::max);
        let denom = max + NORMALIZATION_EPSILON;
        for v in &mut values {
            *v = (*v / denom).clamp(0.0, 1.0);
        }

        Some(Self {
            method,
            width,
            height,
            values,
        })
    }

    /// Method that produced this map.
    #[must_use]
    pub const fn method(&self) -> AttributionMethod {
        self.method
    }

    /// Grid width.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Grid height.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Row-major values.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at `(x, y)`.
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.width + x]
    }

    /// Largest value in the map.
    #[must_use]
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// Upsamples the map to `width x height` with a triangle (bilinear)
    /// filter.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn resize(&self, width: u32, height: u32) -> Vec<f32> {
        let grid: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(self.width as u32, self.height as u32, |x, y| {
                Luma([self.get(x as usize, y as usize)])
            });
        imageops::resize(&grid, width, height, FilterType::Triangle).into_raw()
    }
}
