//! Attribution methods over a [`LayerCapture`].

use candle_core::Tensor;

use super::{capture, LayerCapture};
use crate::domain::{AttributionMethod, ImportanceMap, NORMALIZATION_EPSILON};
use crate::error::AttributionError;
use crate::ports::Classifier;

/// Turns an activation/gradient capture into an importance map.
///
/// Each method runs its own forward/backward cycle through [`Explainer::run`].
pub trait Explainer: Send + Sync {
    /// The algorithm implemented.
    fn method(&self) -> AttributionMethod;

    /// Computes the normalized map for `capture`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails or the map is not finite.
    fn explain(&self, capture: &LayerCapture) -> Result<ImportanceMap, AttributionError>;

    /// Runs a fresh capture cycle for `target_class` and explains it.
    ///
    /// # Errors
    ///
    /// Propagates capture and explain failures.
    fn run(
        &self,
        classifier: &dyn Classifier,
        input: &Tensor,
        target_class: Option<usize>,
    ) -> Result<ImportanceMap, AttributionError> {
        let captured = capture(classifier, input, target_class)?;
        self.explain(&captured)
    }
}

/// Grad-CAM: channel weights are the spatial mean of the gradient.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradCam;

/// Grad-CAM++: channel weights use second- and third-order gradient terms.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradCamPlusPlus;

impl Explainer for GradCam {
    fn method(&self) -> AttributionMethod {
        AttributionMethod::GradCam
    }

    fn explain(&self, capture: &LayerCapture) -> Result<ImportanceMap, AttributionError> {
        let activation = capture.activation();
        let weights = capture.gradient().mean_keepdim((2, 3))?;
        let cam = weights.broadcast_mul(activation)?.sum(1)?;
        finish(self.method(), capture, &cam)
    }
}

impl Explainer for GradCamPlusPlus {
    fn method(&self) -> AttributionMethod {
        AttributionMethod::GradCamPlusPlus
    }

    fn explain(&self, capture: &LayerCapture) -> Result<ImportanceMap, AttributionError> {
        let activation = capture.activation();
        let grad = capture.gradient();

        let grad2 = grad.sqr()?;
        let grad3 = grad2.mul(grad)?;
        let spatial = activation.mul(&grad3)?.sum_keepdim((2, 3))?;
        let denom = grad2.affine(2.0, 0.0)?.broadcast_add(&spatial)?;
        let alpha = grad2.div(&(denom + f64::from(NORMALIZATION_EPSILON))?)?;
        let weights = alpha.mul(&grad.relu()?)?.sum_keepdim((2, 3))?;

        let cam = weights.broadcast_mul(activation)?.sum(1)?;
        finish(self.method(), capture, &cam)
    }
}

/// Rectifies and normalizes a weighted `[1, H, W]` sum into an
/// [`ImportanceMap`].
///
/// Finiteness is checked before the ReLU, which would otherwise turn NaN
/// into zero.
fn finish(
    method: AttributionMethod,
    capture: &LayerCapture,
    cam: &Tensor,
) -> Result<ImportanceMap, AttributionError> {
    let non_finite = || AttributionError::NonFinite {
        method: method.to_string(),
    };
    let (width, height) = capture.spatial_size();
    let values = cam.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(non_finite());
    }
    let rectified = values.into_iter().map(|v| v.max(0.0)).collect();
    ImportanceMap::normalized(method, width, height, rectified).ok_or_else(non_finite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(values: Vec<f32>, c: usize, h: usize, w: usize) -> Tensor {
        Tensor::from_vec(values, (1, c, h, w), &Device::Cpu).unwrap_or_else(|e| panic!("{e}"))
    }

    fn capture_of(activation: Vec<f32>, gradient: Vec<f32>, c: usize, h: usize, w: usize) -> LayerCapture {
        LayerCapture::new(
            tensor(activation, c, h, w),
            tensor(gradient, c, h, w),
            vec![0.0, 1.0],
            1,
            "test",
        )
        .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_grad_cam_picks_positively_weighted_channel() {
        // Channel 0 lights the left column, channel 1 the right column.
        // Only channel 0 has a positive gradient.
        let activation = vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let gradient = vec![0.5; 4].into_iter().chain(vec![-0.5; 4]).collect();
        let map = GradCam
            .explain(&capture_of(activation, gradient, 2, 2, 2))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!((map.width(), map.height()), (2, 2));
        assert!((map.get(0, 0) - 1.0).abs() < 1e-5);
        assert!(map.get(1, 0).abs() < 1e-6);
        assert_eq!(map.method(), AttributionMethod::GradCam);
    }

    #[test]
    fn test_grad_cam_matches_hand_computation() {
        // One channel, weights = mean(g) = 0.25.
        let activation = vec![0.0, 2.0, 4.0, 8.0];
        let gradient = vec![1.0, 0.0, 0.0, 0.0];
        let map = GradCam
            .explain(&capture_of(activation, gradient, 1, 2, 2))
            .unwrap_or_else(|e| panic!("{e}"));
        // cam = [0, .5, 1, 2] -> min 0, max 2
        let expected = [0.0, 0.25, 0.5, 1.0];
        for (got, want) in map.values().iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
    }

    #[test]
    fn test_grad_cam_plus_plus_matches_hand_computation() {
        // One channel 1x2, A = [1, 3], g = [1, 2].
        // sum(A g^3) = 1 + 24 = 25
        // alpha = g^2 / (2 g^2 + 25) = [1/27, 4/33]
        // w = sum(alpha * relu(g)) = 1/27 + 8/33
        // cam = w * A, normalized -> [0, 1] after min subtraction
        let map = GradCamPlusPlus
            .explain(&capture_of(vec![1.0, 3.0], vec![1.0, 2.0], 1, 1, 2))
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(map.get(0, 0).abs() < 1e-6);
        assert!((map.get(1, 0) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_grad_cam_plus_plus_ignores_negative_gradients() {
        let activation = vec![1.0, 0.0, 0.0, 1.0];
        let gradient = vec![0.3, 0.3, -0.9, -0.9];
        let map = GradCamPlusPlus
            .explain(&capture_of(activation, gradient, 2, 1, 2))
            .unwrap_or_else(|e| panic!("{e}"));
        assert!((map.get(0, 0) - 1.0).abs() < 1e-5);
        assert!(map.get(1, 0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_gradient_yields_uniform_map() {
        let activation = vec![1.0, 2.0, 3.0, 4.0];
        for explainer in [&GradCam as &dyn Explainer, &GradCamPlusPlus] {
            let map = explainer
                .explain(&capture_of(activation.clone(), vec![0.0; 4], 1, 2, 2))
                .unwrap_or_else(|e| panic!("{e}"));
            assert!(map.values().iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_non_finite_map_is_an_error() {
        let activation = vec![f32::INFINITY, 1.0, 1.0, 1.0];
        let result = GradCam.explain(&capture_of(activation, vec![1.0; 4], 1, 2, 2));
        assert!(matches!(result, Err(AttributionError::NonFinite { .. })));
    }

    #[test]
    fn test_nan_gradient_is_an_error_for_both_methods() {
        // ReLU maps NaN to zero; the map must still be rejected.
        let activation = vec![1.0, 2.0, 3.0, 4.0];
        let gradient = vec![f32::NAN, 0.1, 0.1, 0.1];
        for explainer in [&GradCam as &dyn Explainer, &GradCamPlusPlus] {
            let result = explainer.explain(&capture_of(activation.clone(), gradient.clone(), 1, 2, 2));
            assert!(
                matches!(result, Err(AttributionError::NonFinite { .. })),
                "{}: {result:?}",
                explainer.method()
            );
        }
    }

    #[test]
    fn test_capture_rejects_bad_shapes() {
        let act = Tensor::zeros((2, 1, 2, 2), candle_core::DType::F32, &Device::Cpu)
            .unwrap_or_else(|e| panic!("{e}"));
        let result = LayerCapture::new(act.clone(), act, vec![0.0, 1.0], 0, "x");
        assert!(matches!(result, Err(AttributionError::UnexpectedShape { .. })));

        let a = tensor(vec![0.0; 4], 1, 2, 2);
        let g = tensor(vec![0.0; 8], 2, 2, 2);
        let result = LayerCapture::new(a, g, vec![0.0, 1.0], 0, "x");
        assert!(matches!(result, Err(AttributionError::ShapeMismatch { .. })));

        let a = tensor(vec![0.0; 4], 1, 2, 2);
        let result = LayerCapture::new(a.clone(), a, vec![0.0, 1.0], 2, "x");
        assert!(matches!(result, Err(AttributionError::InvalidTarget { .. })));
    }
}
