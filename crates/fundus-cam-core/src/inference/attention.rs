//! Spatial soft attention gate appended after the feature stack.

use candle_core::{Module, Result, Tensor};
use candle_nn::ops::sigmoid;
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

/// Gates features with `sigmoid(conv1x1([maxpool(x), avgpool(x)])) * x`.
///
/// Both pools use a 1x1 window with stride 1, so they are identities; the
/// gate sees the features concatenated with themselves.
#[derive(Debug, Clone)]
pub struct SpatialAttention {
    attn_conv: Conv2d,
}

impl SpatialAttention {
    /// Loads `attn_conv.{weight,bias}` from `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights are missing or misshapen.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let attn_conv = conv2d(
            channels * 2,
            channels,
            1,
            Conv2dConfig::default(),
            vb.pp("attn_conv"),
        )?;
        Ok(Self { attn_conv })
    }
}

impl Module for SpatialAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let pooled = Tensor::cat(&[x, x], 1)?;
        let gate = sigmoid(&self.attn_conv.forward(&pooled)?)?;
        gate.mul(x)
    }
}
