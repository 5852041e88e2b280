//! In-memory DICOM file builder.

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

/// Builds small DICOM part 10 files with native pixel data.
#[derive(Debug, Clone)]
pub struct DicomBuilder {
    rows: u16,
    columns: u16,
    samples_per_pixel: u16,
    bits_allocated: u16,
    signed: bool,
    pixels: Vec<u8>,
    rescale: Option<(f64, f64)>,
    include_pixel_data: bool,
}

impl DicomBuilder {
    /// An 8-bit monochrome image whose pixel `(x, y)` is `f(x, y)`.
    #[must_use]
    pub fn mono8(rows: u16, columns: u16, f: impl Fn(u16, u16) -> u8) -> Self {
        let mut pixels = Vec::with_capacity(usize::from(rows) * usize::from(columns));
        for y in 0..rows {
            for x in 0..columns {
                pixels.push(f(x, y));
            }
        }
        Self::raw(rows, columns, 1, 8, pixels)
    }

    /// A 16-bit unsigned monochrome image whose pixel `(x, y)` is `f(x, y)`.
    #[must_use]
    pub fn mono16(rows: u16, columns: u16, f: impl Fn(u16, u16) -> u16) -> Self {
        let mut pixels = Vec::with_capacity(usize::from(rows) * usize::from(columns) * 2);
        for y in 0..rows {
            for x in 0..columns {
                pixels.extend_from_slice(&f(x, y).to_le_bytes());
            }
        }
        Self::raw(rows, columns, 1, 16, pixels)
    }

    /// An 8-bit interleaved RGB image whose pixel `(x, y)` is `f(x, y)`.
    #[must_use]
    pub fn rgb8(rows: u16, columns: u16, f: impl Fn(u16, u16) -> [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(usize::from(rows) * usize::from(columns) * 3);
        for y in 0..rows {
            for x in 0..columns {
                pixels.extend_from_slice(&f(x, y));
            }
        }
        Self::raw(rows, columns, 3, 8, pixels)
    }

    /// Arbitrary little-endian pixel bytes.
    #[must_use]
    pub fn raw(rows: u16, columns: u16, samples_per_pixel: u16, bits_allocated: u16, pixels: Vec<u8>) -> Self {
        Self {
            rows,
            columns,
            samples_per_pixel,
            bits_allocated,
            signed: false,
            pixels,
            rescale: None,
            include_pixel_data: true,
        }
    }

    /// Marks samples as two's complement.
    #[must_use]
    pub const fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Adds RescaleSlope / RescaleIntercept.
    #[must_use]
    pub const fn rescale(mut self, slope: f64, intercept: f64) -> Self {
        self.rescale = Some((slope, intercept));
        self
    }

    /// Leaves out the PixelData element.
    #[must_use]
    pub const fn without_pixel_data(mut self) -> Self {
        self.include_pixel_data = false;
        self
    }

    /// Serializes the file, including preamble and meta group.
    ///
    /// # Panics
    ///
    /// Panics if the object cannot be serialized.
    #[allow(clippy::panic)]
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let photometric = if self.samples_per_pixel == 3 { "RGB" } else { "MONOCHROME2" };
        let mut elements = vec![
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from("2.25.1234567890")),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(self.samples_per_pixel)),
            DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, PrimitiveValue::from(photometric)),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(self.rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(self.columns)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(self.bits_allocated)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(self.bits_allocated)),
            DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(self.bits_allocated - 1)),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(u16::from(self.signed))),
        ];
        if self.samples_per_pixel > 1 {
            elements.push(DataElement::new(tags::PLANAR_CONFIGURATION, VR::US, PrimitiveValue::from(0u16)));
        }
        if let Some((slope, intercept)) = self.rescale {
            elements.push(DataElement::new(tags::RESCALE_SLOPE, VR::DS, PrimitiveValue::from(slope.to_string())));
            elements.push(DataElement::new(
                tags::RESCALE_INTERCEPT,
                VR::DS,
                PrimitiveValue::from(intercept.to_string()),
            ));
        }
        if self.include_pixel_data {
            let vr = if self.bits_allocated > 8 { VR::OW } else { VR::OB };
            let mut pixels = self.pixels.clone();
            if pixels.len() % 2 == 1 {
                pixels.push(0);
            }
            elements.push(DataElement::new(tags::PIXEL_DATA, vr, PrimitiveValue::from(pixels)));
        }

        let file = InMemDicomObject::from_element_iter(elements)
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid("2.25.1234567890"),
            )
            .unwrap_or_else(|e| panic!("building DICOM meta failed: {e}"));

        let mut out = Vec::new();
        file.write_all(&mut out)
            .unwrap_or_else(|e| panic!("writing DICOM failed: {e}"));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_has_magic() {
        let bytes = DicomBuilder::mono8(4, 4, |x, y| u8::try_from(x * 4 + y).unwrap_or(0)).build();
        assert_eq!(&bytes[128..132], b"DICM");
        assert!(fundus_cam_core::domain::has_dicom_magic(&bytes));
    }
}
