//! MobileNetV3-Large feature extractor in the torchvision layout.
//!
//! Only the 17 feature stages are built here. Tensor names follow the
//! torchvision state dict (`<i>.block.<j>...`) relative to the `VarBuilder`.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::layers::{make_divisible, Activation, ConvBn, SqueezeExcite};

/// Channels produced by the last feature stage.
pub const FEATURE_CHANNELS: usize = 960;

/// Number of feature stages (`features.0` .. `features.16`).
pub const NUM_STAGES: usize = 17;

/// One inverted residual block configuration.
#[derive(Debug, Clone, Copy)]
struct BlockConfig {
    input: usize,
    kernel: usize,
    expanded: usize,
    out: usize,
    se: bool,
    activation: Activation,
    stride: usize,
}

const fn block(
    input: usize,
    kernel: usize,
    expanded: usize,
    out: usize,
    se: bool,
    hardswish: bool,
    stride: usize,
) -> BlockConfig {
    BlockConfig {
        input,
        kernel,
        expanded,
        out,
        se,
        activation: if hardswish {
            Activation::Hardswish
        } else {
            Activation::Relu
        },
        stride,
    }
}

#[rustfmt::skip]
const BLOCKS: [BlockConfig; 15] = [
    block(16, 3, 16, 16, false, false, 1),
    block(16, 3, 64, 24, false, false, 2),
    block(24, 3, 72, 24, false, false, 1),
    block(24, 5, 72, 40, true, false, 2),
    block(40, 5, 120, 40, true, false, 1),
    block(40, 5, 120, 40, true, false, 1),
    block(40, 3, 240, 80, false, true, 2),
    block(80, 3, 200, 80, false, true, 1),
    block(80, 3, 184, 80, false, true, 1),
    block(80, 3, 184, 80, false, true, 1),
    block(80, 3, 480, 112, true, true, 1),
    block(112, 3, 672, 112, true, true, 1),
    block(112, 5, 672, 160, true, true, 2),
    block(160, 5, 960, 160, true, true, 1),
    block(160, 5, 960, 160, true, true, 1),
];

/// Expand, depthwise, optional squeeze-excite, project.
#[derive(Debug, Clone)]
struct InvertedResidual {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    se: Option<SqueezeExcite>,
    project: ConvBn,
    residual: bool,
}

impl InvertedResidual {
    #[allow(clippy::needless_pass_by_value)]
    fn new(cfg: BlockConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("block");
        let mut idx = 0;

        let expand = if cfg.expanded == cfg.input {
            None
        } else {
            let layer = ConvBn::new(cfg.input, cfg.expanded, 1, 1, 1, cfg.activation, vb.pp(idx))?;
            idx += 1;
            Some(layer)
        };

        let depthwise = ConvBn::new(
            cfg.expanded,
            cfg.expanded,
            cfg.kernel,
            cfg.stride,
            cfg.expanded,
            cfg.activation,
            vb.pp(idx),
        )?;
        idx += 1;

        let se = if cfg.se {
            let squeeze = make_divisible(cfg.expanded / 4, 8);
            let layer = SqueezeExcite::new(cfg.expanded, squeeze, vb.pp(idx))?;
            idx += 1;
            Some(layer)
        } else {
            None
        };

        let project = ConvBn::new(cfg.expanded, cfg.out, 1, 1, 1, Activation::Identity, vb.pp(idx))?;

        Ok(Self {
            expand,
            depthwise,
            se,
            project,
            residual: cfg.stride == 1 && cfg.input == cfg.out,
        })
    }
}

impl Module for InvertedResidual {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = match &self.expand {
            Some(expand) => expand.forward(x)?,
            None => x.clone(),
        };
        h = self.depthwise.forward(&h)?;
        if let Some(se) = &self.se {
            h = se.forward(&h)?;
        }
        h = self.project.forward(&h)?;
        if self.residual {
            h = (h + x)?;
        }
        Ok(h)
    }
}

/// A single feature stage.
#[derive(Debug, Clone)]
enum Stage {
    Conv(ConvBn),
    Block(InvertedResidual),
}

impl Module for Stage {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(c) => c.forward(x),
            Self::Block(b) => b.forward(x),
        }
    }
}

/// The 17-stage MobileNetV3-Large feature stack.
#[derive(Debug, Clone)]
pub struct MobileNetV3Features {
    stages: Vec<Stage>,
}

impl MobileNetV3Features {
    /// Builds the stack from `vb`, which points at the feature `Sequential`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(NUM_STAGES);
        stages.push(Stage::Conv(ConvBn::new(
            3,
            16,
            3,
            2,
            1,
            Activation::Hardswish,
            vb.pp(0),
        )?));
        for (i, cfg) in BLOCKS.iter().enumerate() {
            stages.push(Stage::Block(InvertedResidual::new(*cfg, vb.pp(i + 1))?));
        }
        stages.push(Stage::Conv(ConvBn::new(
            160,
            FEATURE_CHANNELS,
            1,
            1,
            1,
            Activation::Hardswish,
            vb.pp(NUM_STAGES - 1),
        )?));
        Ok(Self { stages })
    }

    /// Runs stages `range` in order.
    pub fn forward_stages(&self, x: &Tensor, range: std::ops::Range<usize>) -> Result<Tensor> {
        let mut h = x.clone();
        for stage in &self.stages[range] {
            h = stage.forward(&h)?;
        }
        Ok(h)
    }

    /// Output channels of stage `index`.
    #[must_use]
    pub fn stage_channels(index: usize) -> Option<usize> {
        match index {
            0 => Some(16),
            i if i < NUM_STAGES - 1 => Some(BLOCKS[i - 1].out),
            i if i == NUM_STAGES - 1 => Some(FEATURE_CHANNELS),
            _ => None,
        }
    }
}

impl Module for MobileNetV3Features {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_stages(x, 0..self.stages.len())
    }
}
