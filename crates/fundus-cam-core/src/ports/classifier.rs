//! Classifier port: a network that can be split at its attribution layer.

use candle_core::{Device, Result, Tensor};

/// A two-class image classifier with a fixed attribution layer.
///
/// The network is split into the part up to and including the attribution
/// layer and the part after it, so a caller can insert a gradient-tracked
/// leaf at the split point. Implementations must not track gradients for
/// their own parameters.
pub trait Classifier: Send + Sync {
    /// Device the weights live on; inputs must be created there.
    fn device(&self) -> &Device;

    /// Name of the attribution layer, for logs and errors.
    fn target_layer(&self) -> String;

    /// Runs the network from the `[1, 3, H, W]` input to the attribution
    /// layer, returning its `[1, C, h, w]` activation.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn forward_to_target(&self, input: &Tensor) -> Result<Tensor>;

    /// Runs the rest of the network from an attribution-layer activation to
    /// the `[1, classes]` logits.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn forward_from_target(&self, activation: &Tensor) -> Result<Tensor>;

    /// Full forward pass to logits.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn classify(&self, input: &Tensor) -> Result<Tensor> {
        self.forward_from_target(&self.forward_to_target(input)?)
    }
}
