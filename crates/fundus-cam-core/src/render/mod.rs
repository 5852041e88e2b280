//! Visualization: side-by-side heatmap composite encoded as a PNG data URI.
//!
//! Layout is fixed regardless of the uploaded image size: one 224x224 panel
//! per map, each showing the grayscale input under a jet-colored map at 50%
//! opacity, with the method title above it.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

mod colormap;

pub use colormap::jet;

use std::io::Cursor;

use ab_glyph::{FontRef, PxScale};
use anyhow::{ensure, Context, Result};
use base64::Engine as _;
use candle_core::{DType, Tensor};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};

use crate::domain::ImportanceMap;
use crate::preprocess::{IMAGENET_MEAN, IMAGENET_STD, INPUT_SIZE};

/// Opacity of the heatmap over the grayscale image.
pub const HEATMAP_ALPHA: f32 = 0.5;

const MARGIN: u32 = 16;
const TITLE_PX: f32 = 18.0;
const TITLE_BAND: u32 = 28;
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const INK: Rgb<u8> = Rgb([0, 0, 0]);

/// DejaVu Sans Mono Bold, see `assets/DejaVu-LICENSE`.
static TITLE_FONT: &[u8] = include_bytes!("../../assets/DejaVuSansMono-Bold.ttf");

/// Prefix of the data URI returned to clients.
pub const DATA_URI_PREFIX: &str = "data:image/png;base64,";

/// A rendered composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualizationArtifact {
    png: Vec<u8>,
}

impl VisualizationArtifact {
    /// Encoded PNG bytes.
    #[must_use]
    pub fn png(&self) -> &[u8] {
        &self.png
    }

    /// Consumes the artifact, returning the PNG bytes.
    #[must_use]
    pub fn into_png(self) -> Vec<u8> {
        self.png
    }

    /// `data:image/png;base64,...` URI of the PNG.
    #[must_use]
    pub fn data_uri(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.png);
        format!("{DATA_URI_PREFIX}{encoded}")
    }
}

/// Canvas size for `panels` maps.
#[must_use]
pub const fn canvas_size(panels: u32) -> (u32, u32) {
    (
        MARGIN + panels * (INPUT_SIZE + MARGIN),
        MARGIN + TITLE_BAND + INPUT_SIZE + MARGIN,
    )
}

/// Recovers a displayable grayscale image from a normalized `[1, 3, 224, 224]`
/// input tensor.
///
/// # Errors
///
/// Returns an error if the tensor has the wrong shape.
pub fn grayscale_from_input(input: &Tensor) -> Result<Vec<f32>> {
    let size = INPUT_SIZE as usize;
    ensure!(
        input.dims() == [1, 3, size, size],
        "expected a [1, 3, {size}, {size}] input, got {:?}",
        input.dims()
    );
    let data = input
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()
        .context("Failed to read input tensor")?;

    let plane = size * size;
    let mut gray = Vec::with_capacity(plane);
    for i in 0..plane {
        let [r, g, b] = [0, 1, 2].map(|c| (data[c * plane + i] * IMAGENET_STD[c] + IMAGENET_MEAN[c]).clamp(0.0, 1.0));
        gray.push(0.299 * r + 0.587 * g + 0.114 * b);
    }
    Ok(gray)
}

/// Blends a jet-colored map over a grayscale value, both in `[0, 1]`.
fn blend(gray: f32, importance: f32) -> Rgb<u8> {
    let heat = jet(importance);
    Rgb(heat.map(|h| {
        let v = HEATMAP_ALPHA * h + (1.0 - HEATMAP_ALPHA) * gray;
        (v * 255.0).round().clamp(0.0, 255.0) as u8
    }))
}

/// Renders one titled panel per map and encodes the canvas as PNG.
///
/// # Errors
///
/// Returns an error if `maps` is empty, the input has the wrong shape, or
/// PNG encoding fails.
pub fn render(input: &Tensor, maps: &[&ImportanceMap]) -> Result<VisualizationArtifact> {
    ensure!(!maps.is_empty(), "nothing to render");
    let gray = grayscale_from_input(input)?;
    let panels = u32::try_from(maps.len()).context("too many panels")?;
    let (width, height) = canvas_size(panels);
    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);
    let font = FontRef::try_from_slice(TITLE_FONT).context("Failed to parse title font")?;
    let scale = PxScale::from(TITLE_PX);

    let size = INPUT_SIZE as usize;
    let top = MARGIN + TITLE_BAND;
    for (i, map) in (0u32..).zip(maps.iter()) {
        let left = MARGIN + i * (INPUT_SIZE + MARGIN);
        let upsampled = map.resize(INPUT_SIZE, INPUT_SIZE);

        for y in 0..INPUT_SIZE {
            for x in 0..INPUT_SIZE {
                let idx = y as usize * size + x as usize;
                canvas.put_pixel(left + x, top + y, blend(gray[idx], upsampled[idx]));
            }
        }

        let title = map.method().title();
        let (text_width, text_height) = text_size(scale, &font, title);
        let text_left = left + INPUT_SIZE.saturating_sub(text_width) / 2;
        let text_top = MARGIN + TITLE_BAND.saturating_sub(text_height) / 2;
        draw_text_mut(
            &mut canvas,
            INK,
            text_left as i32,
            text_top as i32,
            scale,
            &font,
            title,
        );
    }

    let mut buf = Cursor::new(Vec::new());
    canvas
        .write_to(&mut buf, ImageFormat::Png)
        .context("Failed to encode composite as PNG")?;
    Ok(VisualizationArtifact {
        png: buf.into_inner(),
    })
}
