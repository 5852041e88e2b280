//! Randomly initialised classifier checkpoints.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use fundus_cam_core::inference::GlaucomaNet;
use fundus_cam_core::TargetLayer;

/// Writes a safetensors checkpoint with the production layout and random
/// weights, so binaries can be exercised without the real model.
///
/// # Errors
///
/// Returns an error if the network cannot be built or the file written.
pub fn write_random_checkpoint(path: &Path) -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    GlaucomaNet::new(vb, TargetLayer::FinalConv).context("Failed to build random network")?;
    varmap
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}
