//! Gradient-based class activation mapping.
//!
//! One attribution cycle runs the classifier up to its attribution layer,
//! turns that activation into a fresh autograd leaf, finishes the forward
//! pass and backpropagates a one-hot seed at the target class. The activation
//! and its gradient are returned together by value in a [`LayerCapture`];
//! nothing is stored on the classifier, so concurrent cycles cannot observe
//! each other's tensors.

mod methods;

pub use methods::{Explainer, GradCam, GradCamPlusPlus};

use candle_core::{Tensor, Var};
use tracing::debug;

use crate::error::AttributionError;
use crate::inference::argmax;
use crate::ports::Classifier;

/// Activation and gradient of the attribution layer from one cycle.
#[derive(Debug, Clone)]
pub struct LayerCapture {
    activation: Tensor,
    gradient: Tensor,
    logits: Vec<f32>,
    target_class: usize,
    layer: String,
}

impl LayerCapture {
    /// Assembles a capture from precomputed tensors, validating their shapes.
    ///
    /// # Errors
    ///
    /// Returns an error if the activation is not `[1, C, H, W]`, the gradient
    /// shape differs, or `target_class` is not a valid logit index.
    pub fn new(
        activation: Tensor,
        gradient: Tensor,
        logits: Vec<f32>,
        target_class: usize,
        layer: impl Into<String>,
    ) -> Result<Self, AttributionError> {
        let layer = layer.into();
        let dims = activation.dims();
        if dims.len() != 4 || dims[0] != 1 {
            return Err(AttributionError::UnexpectedShape {
                layer,
                shape: dims.to_vec(),
            });
        }
        if gradient.dims() != dims {
            return Err(AttributionError::ShapeMismatch {
                activation: dims.to_vec(),
                gradient: gradient.dims().to_vec(),
            });
        }
        if target_class >= logits.len() {
            return Err(AttributionError::InvalidTarget {
                class: target_class,
                classes: logits.len(),
            });
        }
        Ok(Self {
            activation,
            gradient,
            logits,
            target_class,
            layer,
        })
    }

    /// `[1, C, H, W]` activation of the attribution layer.
    #[must_use]
    pub const fn activation(&self) -> &Tensor {
        &self.activation
    }

    /// Gradient of the target logit with respect to the activation.
    #[must_use]
    pub const fn gradient(&self) -> &Tensor {
        &self.gradient
    }

    /// Logits of the forward pass that produced this capture.
    #[must_use]
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Class the backward pass was seeded with.
    #[must_use]
    pub const fn target_class(&self) -> usize {
        self.target_class
    }

    /// Name of the captured layer.
    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Spatial size `(width, height)` of the activation.
    #[must_use]
    pub fn spatial_size(&self) -> (usize, usize) {
        let dims = self.activation.dims();
        (dims[3], dims[2])
    }
}

/// Runs one forward/backward cycle and returns the attribution-layer capture.
///
/// The backward pass is seeded with a one-hot at `target_class`, or at the
/// predicted class when `None`. Every call builds a new graph and a new
/// gradient store; nothing accumulates between calls.
///
/// # Errors
///
/// Returns an error if a tensor operation fails, the target class is out of
/// range, or no gradient reaches the attribution layer. A NaN or infinite
/// value in the activation or its gradient is reported as
/// [`AttributionError::NonFiniteCapture`].
pub fn capture(
    classifier: &dyn Classifier,
    input: &Tensor,
    target_class: Option<usize>,
) -> Result<LayerCapture, AttributionError> {
    let layer = classifier.target_layer();
    let activation = classifier.forward_to_target(input)?.detach();
    let leaf = Var::from_tensor(&activation)?;

    let logits = classifier.forward_from_target(leaf.as_tensor())?;
    let (_, classes) = logits.dims2()?;
    let logit_values = logits.flatten_all()?.to_vec1::<f32>()?;

    let class = match target_class {
        Some(class) if class < classes => class,
        Some(class) => return Err(AttributionError::InvalidTarget { class, classes }),
        None => argmax(&logit_values).ok_or(AttributionError::InvalidTarget { class: 0, classes })?,
    };

    let mut seed = vec![0f32; classes];
    seed[class] = 1.0;
    let seed = Tensor::from_vec(seed, (1, classes), logits.device())?;
    let score = logits.mul(&seed)?.sum_all()?;
    let grads = score.backward()?;

    let gradient = grads
        .get(leaf.as_tensor())
        .ok_or_else(|| AttributionError::MissingGradient { layer: layer.clone() })?
        .detach();

    ensure_finite(&activation, &layer, "activation")?;
    ensure_finite(&gradient, &layer, "gradient")?;

    debug!(layer = %layer, class, shape = ?activation.dims(), "Captured attribution layer");
    LayerCapture::new(activation, gradient, logit_values, class, layer)
}

fn ensure_finite(tensor: &Tensor, layer: &str, name: &'static str) -> Result<(), AttributionError> {
    let values = tensor.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(AttributionError::NonFiniteCapture {
            layer: layer.to_string(),
            tensor: name,
        })
    }
}
