//! Glaucoma classifier: MobileNetV3-Large features, spatial attention and a
//! three-layer head producing two logits.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::attention::SpatialAttention;
use super::loader::load_safetensors;
use super::mobilenet::{MobileNetV3Features, FEATURE_CHANNELS, NUM_STAGES};
use crate::domain::NUM_CLASSES;
use crate::ports::Classifier;

/// Index of the attention module inside the checkpoint's feature `Sequential`.
const ATTENTION_INDEX: usize = NUM_STAGES;

/// Layer whose activations and gradients feed the attribution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetLayer {
    /// The last 1x1 conv of the feature stack (`features.16`, 960 channels).
    #[default]
    FinalConv,
    /// Output of the spatial attention gate.
    Attention,
    /// Output of feature stage `n` (`0..=16`).
    Block(usize),
}

impl TargetLayer {
    /// Feature-stage index the capture happens after.
    #[must_use]
    pub const fn stage_index(self) -> usize {
        match self {
            Self::FinalConv => NUM_STAGES - 1,
            Self::Attention => ATTENTION_INDEX,
            Self::Block(n) => n,
        }
    }

    /// Activation channels at this layer.
    #[must_use]
    pub fn channels(self) -> usize {
        match self {
            Self::FinalConv | Self::Attention => FEATURE_CHANNELS,
            Self::Block(n) => MobileNetV3Features::stage_channels(n).unwrap_or(FEATURE_CHANNELS),
        }
    }
}

impl fmt::Display for TargetLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FinalConv => f.write_str("final_conv"),
            Self::Attention => f.write_str("attention"),
            Self::Block(n) => write!(f, "block:{n}"),
        }
    }
}

impl FromStr for TargetLayer {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "final_conv" => Ok(Self::FinalConv),
            "attention" => Ok(Self::Attention),
            other => {
                let n = other
                    .strip_prefix("block:")
                    .and_then(|n| n.parse::<usize>().ok())
                    .ok_or_else(|| {
                        format!("unknown target layer '{other}' (expected final_conv, attention or block:<n>)")
                    })?;
                if n >= NUM_STAGES {
                    return Err(format!("block index {n} out of range 0..={}", NUM_STAGES - 1));
                }
                Ok(if n == NUM_STAGES - 1 { Self::FinalConv } else { Self::Block(n) })
            }
        }
    }
}

impl TryFrom<String> for TargetLayer {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetLayer> for String {
    fn from(value: TargetLayer) -> Self {
        value.to_string()
    }
}

/// The production classifier.
///
/// Weights are plain tensors; no parameter gradients are ever tracked.
#[derive(Debug, Clone)]
pub struct GlaucomaNet {
    features: MobileNetV3Features,
    attention: SpatialAttention,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    target: TargetLayer,
    device: Device,
}

impl GlaucomaNet {
    /// Builds the network from a root `VarBuilder` over the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a weight is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(vb: VarBuilder, target: TargetLayer) -> Result<Self> {
        let device = vb.device().clone();
        let feats = vb.pp("0");
        let features = MobileNetV3Features::new(feats.clone()).context("Failed to build feature stack")?;
        let attention = SpatialAttention::new(FEATURE_CHANNELS, feats.pp(ATTENTION_INDEX))
            .context("Failed to build attention gate")?;

        let head = vb.pp("1");
        let fc1 = linear(FEATURE_CHANNELS, 1024, head.pp("1")).context("Failed to build head layer 1")?;
        let fc2 = linear(1024, 512, head.pp("4")).context("Failed to build head layer 2")?;
        let fc3 = linear(512, NUM_CLASSES, head.pp("7")).context("Failed to build head layer 3")?;

        Ok(Self {
            features,
            attention,
            fc1,
            fc2,
            fc3,
            target,
            device,
        })
    }

    /// Loads the network from a safetensors checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not match the
    /// architecture.
    pub fn load(path: impl AsRef<Path>, device: &Device, target: TargetLayer) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), %target, "Loading glaucoma classifier");
        let vb = load_safetensors(path, device)?;
        Self::new(vb, target).with_context(|| format!("Checkpoint {} does not match the network", path.display()))
    }

    /// The configured attribution layer.
    #[must_use]
    pub const fn target(&self) -> TargetLayer {
        self.target
    }

    fn head(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = x.mean(3)?.mean(2)?;
        let h = self.fc1.forward(&pooled)?.relu()?;
        let h = self.fc2.forward(&h)?.relu()?;
        self.fc3.forward(&h)
    }
}

impl Classifier for GlaucomaNet {
    fn device(&self) -> &Device {
        &self.device
    }

    fn target_layer(&self) -> String {
        self.target.to_string()
    }

    fn forward_to_target(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        match self.target {
            TargetLayer::Attention => {
                let feats = self.features.forward(input)?;
                self.attention.forward(&feats)
            }
            other => self.features.forward_stages(input, 0..other.stage_index() + 1),
        }
    }

    fn forward_from_target(&self, activation: &Tensor) -> candle_core::Result<Tensor> {
        let gated = match self.target {
            TargetLayer::Attention => activation.clone(),
            other => {
                let feats = self
                    .features
                    .forward_stages(activation, other.stage_index() + 1..NUM_STAGES)?;
                self.attention.forward(&feats)?
            }
        };
        self.head(&gated)
    }
}
