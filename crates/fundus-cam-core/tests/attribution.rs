//! Attribution cycles against the mock classifier.

#![allow(clippy::unwrap_used)]

use candle_core::{Device, Tensor};
use fundus_cam_core::attribution::{capture, Explainer, GradCam, GradCamPlusPlus};
use fundus_cam_core::ports::Classifier;
use fundus_cam_core::preprocess;
use fundus_cam_core::AttributionError;
use fundus_cam_test_support::{MockClassifier, SyntheticImageBuilder};

fn input() -> Tensor {
    preprocess::preprocess(&SyntheticImageBuilder::bright_ring(224, 224), &Device::Cpu)
        .unwrap()
        .into_tensor()
}

#[test]
fn test_capture_returns_activation_and_gradient() {
    let net = MockClassifier::new();
    let x = input();
    let cap = capture(&net, &x, None).unwrap();

    assert_eq!(cap.activation().dims(), &[1, 4, 7, 7]);
    assert_eq!(cap.gradient().dims(), cap.activation().dims());
    assert_eq!(cap.layer(), "mock_features");
    assert_eq!(cap.logits().len(), 2);

    let logits = net.classify(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let predicted = usize::from(logits[1] > logits[0]);
    assert_eq!(cap.target_class(), predicted);
}

#[test]
fn test_gradient_matches_analytic_value() {
    // d logit_k / d A[c, y, x] = head[c, k] / 49 for the mock's mean pooling.
    let net = MockClassifier::new();
    let cap = capture(&net, &input(), Some(1)).unwrap();
    let grad = cap.gradient().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let head_col = [-0.6f32, 0.8, 0.1, 0.5];
    for (c, expected) in head_col.iter().enumerate() {
        let got = grad[c * 49];
        assert!((got - expected / 49.0).abs() < 1e-6, "channel {c}: {got}");
        assert!(grad[c * 49..(c + 1) * 49].iter().all(|g| (g - got).abs() < 1e-7));
    }
}

#[test]
fn test_cycles_do_not_accumulate() {
    let net = MockClassifier::new();
    let x = input();
    let first = capture(&net, &x, Some(0)).unwrap();
    let second = capture(&net, &x, Some(0)).unwrap();
    let a = first.gradient().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let b = second.gradient().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_explicit_target_class_out_of_range() {
    let net = MockClassifier::new();
    let err = capture(&net, &input(), Some(5)).unwrap_err();
    assert!(matches!(err, AttributionError::InvalidTarget { class: 5, classes: 2 }));
}

#[test]
fn test_both_methods_highlight_the_ring() {
    let net = MockClassifier::new();
    let x = input();
    for explainer in [&GradCam as &dyn Explainer, &GradCamPlusPlus] {
        let map = explainer.run(&net, &x, None).unwrap();
        assert_eq!((map.width(), map.height()), (7, 7));
        // The ring passes through cell (1, 3); the center cell is background.
        assert!((map.get(1, 3) - map.get(3, 3)).abs() > 1e-3, "{}", explainer.method());
    }
}
