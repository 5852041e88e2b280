//! Integration tests for the DICOM container decoder.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use fundus_cam_adapters::DicomDecoder;
use fundus_cam_core::{AnalyzeError, ContainerDecoder, InferenceService, RawImage};
use fundus_cam_test_support::{DicomBuilder, MockClassifier};

#[test]
fn test_mono8_expands_to_gray_rgb() {
    let bytes = DicomBuilder::mono8(4, 6, |x, y| u8::try_from(x * 10 + y).unwrap()).build();
    let img = DicomDecoder.decode(&bytes).unwrap();
    assert_eq!(img.dimensions(), (6, 4));
    let p = img.get_pixel(3, 2);
    assert_eq!(p[0], p[1]);
    assert_eq!(p[1], p[2]);
    // Min-max: the darkest pixel maps to 0, the brightest to 255.
    assert_eq!(img.get_pixel(0, 0)[0], 0);
    assert_eq!(img.get_pixel(5, 3)[0], 255);
}

#[test]
fn test_mono16_is_normalized() {
    let bytes = DicomBuilder::mono16(2, 2, |x, y| 1000 + 1000 * (x + 2 * y)).build();
    let img = DicomDecoder.decode(&bytes).unwrap();
    let values: Vec<u8> = img.pixels().map(|p| p[0]).collect();
    assert_eq!(values, vec![0, 85, 170, 255]);
}

#[test]
fn test_rescale_is_applied_before_normalization() {
    // A negative slope inverts the image.
    let plain = DicomBuilder::mono8(1, 3, |x, _| u8::try_from(x * 50).unwrap()).build();
    let inverted = DicomBuilder::mono8(1, 3, |x, _| u8::try_from(x * 50).unwrap())
        .rescale(-2.0, 100.0)
        .build();
    let a = DicomDecoder.decode(&plain).unwrap();
    let b = DicomDecoder.decode(&inverted).unwrap();
    assert_eq!(a.get_pixel(0, 0)[0], 0);
    assert_eq!(b.get_pixel(0, 0)[0], 255);
    assert_eq!(b.get_pixel(2, 0)[0], 0);
}

#[test]
fn test_signed_samples() {
    let pixels: Vec<u8> = [-100i16, 0, 100, 300]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let bytes = DicomBuilder::raw(2, 2, 1, 16, pixels).signed().build();
    let img = DicomDecoder.decode(&bytes).unwrap();
    assert_eq!(img.get_pixel(0, 0)[0], 0);
    assert_eq!(img.get_pixel(1, 1)[0], 255);
    assert_eq!(img.get_pixel(1, 0)[0], 64);
}

#[test]
fn test_rgb_is_kept() {
    let bytes = DicomBuilder::rgb8(2, 2, |x, y| if x == 0 && y == 0 { [255, 0, 0] } else { [0, 0, 255] }).build();
    let img = DicomDecoder.decode(&bytes).unwrap();
    assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0]);
    assert_eq!(img.get_pixel(1, 1).0, [0, 0, 255]);
}

#[test]
fn test_missing_pixel_data_is_an_error() {
    let bytes = DicomBuilder::mono8(2, 2, |_, _| 1).without_pixel_data().build();
    let err = DicomDecoder.decode(&bytes).unwrap_err();
    assert!(format!("{err:#}").contains("PixelData"));
}

#[test]
fn test_truncated_pixel_data_is_an_error() {
    let bytes = DicomBuilder::raw(4, 4, 1, 8, vec![1, 2, 3, 4]).build();
    assert!(DicomDecoder.decode(&bytes).is_err());
}

#[test]
fn test_service_analyzes_dicom_through_decoder() {
    let service = InferenceService::with_classifier(Arc::new(MockClassifier::new()))
        .with_container_decoder(Arc::new(DicomDecoder));
    let bytes = DicomBuilder::mono8(64, 64, |x, y| {
        let (dx, dy) = (i32::from(x) - 32, i32::from(y) - 32);
        if (dx * dx + dy * dy) < 400 { 220 } else { 30 }
    })
    .build();

    let report = service
        .analyze(&RawImage::new(&bytes, "application/dicom"))
        .expect("DICOM should analyze");
    assert!(report.prediction_class <= 1);
    assert!(report.heatmap_image.starts_with("data:image/png;base64,"));
}

#[test]
fn test_service_maps_bad_dicom_to_invalid_input() {
    let service = InferenceService::with_classifier(Arc::new(MockClassifier::new()))
        .with_container_decoder(Arc::new(DicomDecoder));
    let mut bytes = vec![0u8; 128];
    bytes.extend_from_slice(b"DICMgarbage");
    let err = service
        .analyze(&RawImage::new(&bytes, "application/dicom"))
        .unwrap_err();
    assert!(matches!(err, AnalyzeError::InvalidInput(_)));
}
