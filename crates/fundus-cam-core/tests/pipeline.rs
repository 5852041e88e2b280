//! End-to-end behaviour of the analyze pipeline with a mock classifier.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::Engine as _;
use candle_core::{Device, Tensor};
use fundus_cam_core::domain::RawImage;
use fundus_cam_core::ports::Classifier;
use fundus_cam_core::render::canvas_size;
use fundus_cam_core::{AnalyzeError, InferenceService, Stage};
use fundus_cam_test_support::{MockClassifier, SyntheticImageBuilder};

fn service() -> InferenceService {
    InferenceService::with_classifier(Arc::new(MockClassifier::new()))
}

fn decode_data_uri(uri: &str) -> Vec<u8> {
    let payload = uri.strip_prefix("data:image/png;base64,").unwrap();
    base64::engine::general_purpose::STANDARD.decode(payload).unwrap()
}

#[test]
fn test_bright_ring_produces_valid_report() {
    let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::bright_ring(512, 512));
    let report = service().analyze(&RawImage::new(&png, "image/png")).unwrap();

    assert!(report.prediction_class <= 1);
    assert!((0.0..=1.0).contains(&report.probability));
    assert!(["No Glaucoma", "Glaucoma Detected"].contains(&report.prediction_label.as_str()));

    let composite = image::load_from_memory(&decode_data_uri(&report.heatmap_image)).unwrap();
    assert_eq!((composite.width(), composite.height()), canvas_size(2));
}

#[test]
fn test_prediction_is_argmax_of_probabilities() {
    let jpeg = SyntheticImageBuilder::jpeg_bytes(&SyntheticImageBuilder::fundus(300, 260));
    let explanation = service().explain(&RawImage::new(&jpeg, "image/jpeg")).unwrap();

    let probs = &explanation.probabilities;
    assert_eq!(probs.len(), 2);
    assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    let argmax = usize::from(probs[1] > probs[0]);
    assert_eq!(explanation.prediction.class_index, argmax);
    assert!((explanation.prediction.probability - probs[argmax]).abs() < 1e-6);
}

/// Wraps the mock so both classes receive the same logit.
struct TiedClassifier(MockClassifier);

impl Classifier for TiedClassifier {
    fn device(&self) -> &Device {
        self.0.device()
    }

    fn target_layer(&self) -> String {
        self.0.target_layer()
    }

    fn forward_to_target(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.0.forward_to_target(input)
    }

    fn forward_from_target(&self, activation: &Tensor) -> candle_core::Result<Tensor> {
        let first = self.0.forward_from_target(activation)?.narrow(1, 0, 1)?;
        Tensor::cat(&[&first, &first], 1)
    }
}

#[test]
fn test_tied_logits_report_first_class() {
    let service = InferenceService::with_classifier(Arc::new(TiedClassifier(MockClassifier::new())));
    let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::fundus(224, 224));
    let report = service.analyze(&RawImage::new(&png, "image/png")).unwrap();

    assert_eq!(report.prediction_class, 0);
    assert_eq!(report.prediction_label, "No Glaucoma");
    assert!((report.probability - 0.5).abs() < 1e-6);
}

#[test]
fn test_maps_are_normalized() {
    let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::fundus(256, 256));
    let explanation = service().explain(&RawImage::new(&png, "image/png")).unwrap();

    assert_eq!(explanation.maps.len(), 2);
    for map in &explanation.maps {
        assert_eq!((map.width(), map.height()), (7, 7));
        assert!(map.values().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((map.max() - 1.0).abs() < 1e-3, "{} max {}", map.method(), map.max());
    }
}

#[test]
fn test_analysis_is_deterministic() {
    let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::fundus(200, 200));
    let raw = RawImage::new(&png, "image/png");
    let svc = service();
    let a = svc.explain(&raw).unwrap();
    let b = svc.explain(&raw).unwrap();

    assert!((a.prediction.probability - b.prediction.probability).abs() < 1e-5);
    for (ma, mb) in a.maps.iter().zip(b.maps.iter()) {
        for (x, y) in ma.values().iter().zip(mb.values().iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }
    assert_eq!(a.artifact.png(), b.artifact.png());
}

#[test]
fn test_composite_size_is_independent_of_input_size() {
    let svc = service();
    for (w, h) in [(64, 64), (640, 480), (120, 900)] {
        let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::gradient(w, h));
        let explanation = svc.explain(&RawImage::new(&png, "image/png")).unwrap();
        let composite = image::load_from_memory(explanation.artifact.png()).unwrap();
        assert_eq!((composite.width(), composite.height()), canvas_size(2));
    }
}

#[test]
fn test_non_image_bytes_never_reach_classifier() {
    let mock = MockClassifier::new();
    let calls = mock.call_counter();
    let svc = InferenceService::with_classifier(Arc::new(mock));

    let err = svc
        .analyze(&RawImage::new(b"%PDF-1.4 definitely not a picture", "image/png"))
        .unwrap_err();
    assert!(matches!(err, AnalyzeError::Decode(_)));
    assert_eq!(err.status_code(), 400);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_upload_is_decode_error() {
    let err = service().analyze(&RawImage::new(&[], "image/jpeg")).unwrap_err();
    assert!(matches!(err, AnalyzeError::Decode(_)));
    assert_eq!(err.code(), "decode_error");
}

#[test]
fn test_wrong_content_type_rejected_before_decode() {
    let mock = MockClassifier::new();
    let calls = mock.call_counter();
    let svc = InferenceService::with_classifier(Arc::new(mock));

    let jpeg = SyntheticImageBuilder::jpeg_bytes(&SyntheticImageBuilder::fundus(64, 64));
    let err = svc.analyze(&RawImage::new(&jpeg, "text/plain")).unwrap_err();
    assert!(matches!(err, AnalyzeError::InvalidInput(_)));
    assert_eq!(err.code(), "invalid_input");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_dicom_without_decoder_is_invalid_input() {
    let bytes = fundus_cam_test_support::DicomBuilder::mono8(16, 16, |x, _| u8::try_from(x).unwrap_or(0)).build();
    let err = service().analyze(&RawImage::new(&bytes, "application/dicom")).unwrap_err();
    assert!(matches!(err, AnalyzeError::InvalidInput(_)));
}

#[test]
fn test_missing_gradient_is_attribution_error() {
    let svc = InferenceService::with_classifier(Arc::new(MockClassifier::detached()));
    let png = SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::fundus(64, 64));
    let err = svc.analyze(&RawImage::new(&png, "image/png")).unwrap_err();
    assert!(matches!(err, AnalyzeError::Attribution { .. }));
    assert_eq!(err.stage(), Some(Stage::AttributedGradCam));
    assert_eq!(err.code(), "attribution_error");
}

#[test]
fn test_concurrent_analyses_match_sequential() {
    let svc = Arc::new(service());
    let inputs: Vec<Vec<u8>> = [(128, 128), (200, 150), (90, 300), (256, 256)]
        .iter()
        .map(|&(w, h)| SyntheticImageBuilder::png_bytes(&SyntheticImageBuilder::fundus(w, h)))
        .collect();

    let sequential: Vec<_> = inputs
        .iter()
        .map(|bytes| svc.analyze(&RawImage::new(bytes, "image/png")).unwrap())
        .collect();

    let handles: Vec<_> = inputs
        .iter()
        .cloned()
        .map(|bytes| {
            let svc = Arc::clone(&svc);
            std::thread::spawn(move || svc.analyze(&RawImage::new(&bytes, "image/png")).unwrap())
        })
        .collect();
    let concurrent: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for (a, b) in sequential.iter().zip(concurrent.iter()) {
        assert_eq!(a.prediction_class, b.prediction_class);
        assert!((a.probability - b.probability).abs() < 1e-5);
        assert_eq!(a.heatmap_image, b.heatmap_image);
    }
}

#[test]
fn test_unavailable_service_reports_before_content_checks() {
    let svc = InferenceService::unavailable("no checkpoint");
    let err = svc.analyze(&RawImage::new(&[], "text/plain")).unwrap_err();
    assert!(matches!(err, AnalyzeError::ServiceUnavailable(_)));
    assert_eq!(err.status_code(), 503);
}
