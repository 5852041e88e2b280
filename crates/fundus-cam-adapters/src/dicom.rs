//! DICOM container decoder.
//!
//! Only native (uncompressed) pixel data is supported. Samples are rescaled
//! with RescaleSlope/RescaleIntercept when present, then min-max normalized
//! to 8 bits. Monochrome images are expanded to RGB.

use anyhow::{bail, Context, Result};
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{from_reader, DefaultDicomObject};
use fundus_cam_core::domain::has_dicom_magic;
use fundus_cam_core::ContainerDecoder;
use image::{Rgb, RgbImage};
use tracing::debug;

/// Size of the part 10 preamble preceding the `DICM` magic.
const PREAMBLE_LEN: usize = 128;

/// [`ContainerDecoder`] for DICOM part 10 files.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomDecoder;

impl ContainerDecoder for DicomDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<RgbImage> {
        decode_dicom(bytes)
    }
}

/// Pixel layout read from the dataset.
#[derive(Debug, Clone, Copy)]
struct PixelLayout {
    rows: u32,
    columns: u32,
    samples_per_pixel: u16,
    bits_allocated: u16,
    signed: bool,
    planar: bool,
}

impl PixelLayout {
    fn read(obj: &DefaultDicomObject) -> Result<Self> {
        let rows = required_u16(obj, tags::ROWS, "Rows")?;
        let columns = required_u16(obj, tags::COLUMNS, "Columns")?;
        let samples_per_pixel = optional_u16(obj, tags::SAMPLES_PER_PIXEL)?.unwrap_or(1);
        let bits_allocated = required_u16(obj, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let signed = optional_u16(obj, tags::PIXEL_REPRESENTATION)?.unwrap_or(0) == 1;
        let planar = optional_u16(obj, tags::PLANAR_CONFIGURATION)?.unwrap_or(0) == 1;

        if rows == 0 || columns == 0 {
            bail!("image has zero rows or columns");
        }
        if samples_per_pixel != 1 && samples_per_pixel != 3 {
            bail!("unsupported SamplesPerPixel {samples_per_pixel}");
        }
        if bits_allocated != 8 && bits_allocated != 16 {
            bail!("unsupported BitsAllocated {bits_allocated}");
        }

        Ok(Self {
            rows: u32::from(rows),
            columns: u32::from(columns),
            samples_per_pixel,
            bits_allocated,
            signed,
            planar,
        })
    }

    fn sample_count(self) -> usize {
        self.rows as usize * self.columns as usize * usize::from(self.samples_per_pixel)
    }
}

/// Decodes a DICOM file into an 8-bit RGB image.
///
/// # Errors
///
/// Returns an error if the magic is missing, the dataset cannot be parsed,
/// a required attribute is absent, or the pixel data is encapsulated,
/// truncated or in an unsupported layout.
pub fn decode_dicom(bytes: &[u8]) -> Result<RgbImage> {
    let body = if has_dicom_magic(bytes) {
        &bytes[PREAMBLE_LEN..]
    } else if bytes.starts_with(b"DICM") {
        bytes
    } else {
        bail!("missing DICM magic");
    };

    let obj = from_reader(body).context("failed to parse DICOM dataset")?;
    let layout = PixelLayout::read(&obj)?;
    let slope = optional_f64(&obj, tags::RESCALE_SLOPE)?.unwrap_or(1.0);
    let intercept = optional_f64(&obj, tags::RESCALE_INTERCEPT)?.unwrap_or(0.0);
    debug!(?layout, slope, intercept, "decoding DICOM pixel data");

    let pixel_data = obj
        .get(tags::PIXEL_DATA)
        .context("dataset has no PixelData element")?
        .to_bytes()
        .context("encapsulated (compressed) pixel data is not supported")?;

    let mut samples = read_samples(&pixel_data, layout)?;
    for s in &mut samples {
        *s = *s * slope + intercept;
    }
    let normalized = normalize_to_u8(&samples);

    Ok(assemble_rgb(&normalized, layout))
}

fn required_u16(obj: &DefaultDicomObject, tag: Tag, name: &str) -> Result<u16> {
    optional_u16(obj, tag)?.with_context(|| format!("missing {name} attribute"))
}

fn optional_u16(obj: &DefaultDicomObject, tag: Tag) -> Result<Option<u16>> {
    obj.get(tag)
        .map(|e| e.to_int::<u16>().with_context(|| format!("invalid value for {tag}")))
        .transpose()
}

fn optional_f64(obj: &DefaultDicomObject, tag: Tag) -> Result<Option<f64>> {
    obj.get(tag)
        .map(|e| e.to_float64().with_context(|| format!("invalid value for {tag}")))
        .transpose()
}

/// Interprets little-endian pixel bytes as numeric samples.
fn read_samples(data: &[u8], layout: PixelLayout) -> Result<Vec<f64>> {
    let expected = layout.sample_count();
    let samples: Vec<f64> = match (layout.bits_allocated, layout.signed) {
        (8, false) => data.iter().map(|&b| f64::from(b)).collect(),
        (8, true) => data.iter().map(|&b| f64::from(i8::from_le_bytes([b]))).collect(),
        (16, false) => data
            .chunks_exact(2)
            .map(|c| f64::from(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        (16, true) => data
            .chunks_exact(2)
            .map(|c| f64::from(i16::from_le_bytes([c[0], c[1]])))
            .collect(),
        (bits, _) => bail!("unsupported BitsAllocated {bits}"),
    };

    if samples.len() < expected {
        bail!(
            "pixel data truncated: expected {expected} samples, found {}",
            samples.len()
        );
    }
    Ok(samples.into_iter().take(expected).collect())
}

/// Min-max normalization to `0..=255`. A constant image maps to zero.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn normalize_to_u8(samples: &[f64]) -> Vec<u8> {
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return vec![0; samples.len()];
    }
    samples
        .iter()
        .map(|&v| ((v - min) / range * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect()
}

fn assemble_rgb(values: &[u8], layout: PixelLayout) -> RgbImage {
    let (w, h) = (layout.columns, layout.rows);
    let plane = w as usize * h as usize;
    RgbImage::from_fn(w, h, |x, y| {
        let i = y as usize * w as usize + x as usize;
        match (layout.samples_per_pixel, layout.planar) {
            (1, _) => Rgb([values[i]; 3]),
            (_, false) => Rgb([values[3 * i], values[3 * i + 1], values[3 * i + 2]]),
            (_, true) => Rgb([values[i], values[plane + i], values[2 * plane + i]]),
        }
    })
}
