//! Building blocks shared by the classifier: folded conv+BN, activations and
//! squeeze-excite.
//!
//! The hard activations are composed from elementary tensor ops so that the
//! backward pass can flow through them.

use candle_core::{Module, Result, Tensor};
use candle_nn::{init, Conv2d, Conv2dConfig, Init, VarBuilder};

/// BatchNorm epsilon used by the torchvision MobileNetV3 definition.
pub const BN_EPSILON: f64 = 0.001;

/// Non-linearity applied after a conv.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Hardswish,
}

impl Activation {
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Relu => x.relu(),
            Self::Hardswish => hardswish(x),
        }
    }
}

/// `x * relu6(x + 3) / 6`
pub fn hardswish(x: &Tensor) -> Result<Tensor> {
    x.mul(&hardsigmoid(x)?)
}

/// `relu6(x + 3) / 6`
pub fn hardsigmoid(x: &Tensor) -> Result<Tensor> {
    x.affine(1.0, 3.0)?.clamp(0f32, 6f32)?.affine(1.0 / 6.0, 0.0)
}

/// A bias-free conv followed by frozen BatchNorm, folded into one biased conv.
#[derive(Debug, Clone)]
pub struct ConvBn {
    conv: Conv2d,
    activation: Activation,
}

impl ConvBn {
    /// Loads `{prefix}.0.weight` (conv) and `{prefix}.1.*` (BatchNorm) from `vb`,
    /// which must already point at the module prefix.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.pp("0").get_with_hints(
            (out_channels, in_channels / groups, kernel, kernel),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bn = vb.pp("1");
        let gamma = bn.get_with_hints(out_channels, "weight", Init::Const(1.0))?;
        let beta = bn.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
        let mean = bn.get_with_hints(out_channels, "running_mean", Init::Const(0.0))?;
        let var = bn.get_with_hints(out_channels, "running_var", Init::Const(1.0))?;

        let (weight, bias) = fold_batch_norm(&weight, &gamma, &beta, &mean, &var)?;
        let config = Conv2dConfig {
            padding: (kernel - 1) / 2,
            stride,
            groups,
            ..Conv2dConfig::default()
        };
        Ok(Self {
            conv: Conv2d::new(weight, Some(bias), config),
            activation,
        })
    }
}

impl Module for ConvBn {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.activation.apply(&self.conv.forward(x)?)
    }
}

/// Folds eval-mode BatchNorm into the preceding conv's weight and bias.
pub fn fold_batch_norm(
    weight: &Tensor,
    gamma: &Tensor,
    beta: &Tensor,
    mean: &Tensor,
    var: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let scale = gamma.div(&(var + BN_EPSILON)?.sqrt()?)?;
    let out_channels = scale.dim(0)?;
    let weight = weight.broadcast_mul(&scale.reshape((out_channels, 1, 1, 1))?)?;
    let bias = beta.sub(&mean.mul(&scale)?)?;
    Ok((weight, bias))
}

/// Channel gating from globally pooled features (hardsigmoid gate).
#[derive(Debug, Clone)]
pub struct SqueezeExcite {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcite {
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(channels: usize, squeeze: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::conv2d(channels, squeeze, 1, Conv2dConfig::default(), vb.pp("fc1"))?,
            fc2: candle_nn::conv2d(squeeze, channels, 1, Conv2dConfig::default(), vb.pp("fc2"))?,
        })
    }
}

impl Module for SqueezeExcite {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let pooled = x.mean_keepdim(3)?.mean_keepdim(2)?;
        let scale = self.fc2.forward(&self.fc1.forward(&pooled)?.relu()?)?;
        x.broadcast_mul(&hardsigmoid(&scale)?)
    }
}

/// Rounds `value` to the nearest multiple of `divisor`, never dropping more
/// than 10% below the original.
#[must_use]
pub fn make_divisible(value: usize, divisor: usize) -> usize {
    let rounded = ((value + divisor / 2) / divisor * divisor).max(divisor);
    if rounded * 10 < value * 9 {
        rounded + divisor
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_hardswish() {
        let x = Tensor::new(&[-4f32, -1.5, 0.0, 1.5, 4.0], &Device::Cpu)
            .unwrap_or_else(|e| panic!("{e}"));
        let hs = values(&hardswish(&x).unwrap_or_else(|e| panic!("{e}")));
        let expected = [0.0, -0.375, 0.0, 1.125, 4.0];
        for (a, b) in hs.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
        let hsig = values(&hardsigmoid(&x).unwrap_or_else(|e| panic!("{e}")));
        assert_eq!(hsig[0], 0.0);
        assert!((hsig[2] - 0.5).abs() < 1e-6);
        assert_eq!(hsig[4], 1.0);
    }

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(72 / 4, 8), 24);
        assert_eq!(make_divisible(120 / 4, 8), 32);
        assert_eq!(make_divisible(480 / 4, 8), 120);
        assert_eq!(make_divisible(672 / 4, 8), 168);
        assert_eq!(make_divisible(960 / 4, 8), 240);
    }

    #[test]
    fn test_fold_batch_norm_matches_unfolded() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[[[2f32]]], [[[3f32]]]], &dev).unwrap_or_else(|e| panic!("{e}"));
        let gamma = Tensor::new(&[1f32, 2.0], &dev).unwrap_or_else(|e| panic!("{e}"));
        let beta = Tensor::new(&[0.5f32, -1.0], &dev).unwrap_or_else(|e| panic!("{e}"));
        let mean = Tensor::new(&[1f32, 0.0], &dev).unwrap_or_else(|e| panic!("{e}"));
        let var = Tensor::new(&[4f32, 1.0], &dev).unwrap_or_else(|e| panic!("{e}"));
        let (fw, fb) = fold_batch_norm(&w, &gamma, &beta, &mean, &var).unwrap_or_else(|e| panic!("{e}"));

        // Channel 0 at input 1: conv=2, bn=(2-1)/sqrt(4.001)*1+0.5
        let x = 1.0f32;
        let expected0 = (2.0 * x - 1.0) / (4.0f32 + 0.001).sqrt() + 0.5;
        let got0 = values(&fw)[0] * x + values(&fb)[0];
        assert!((expected0 - got0).abs() < 1e-5);

        let expected1 = 2.0 * (3.0 * x) / (1.0f32 + 0.001).sqrt() - 1.0;
        let got1 = values(&fw)[1] * x + values(&fb)[1];
        assert!((expected1 - got1).abs() < 1e-5);
    }
}
