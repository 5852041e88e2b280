//! Checkpoint loading from safetensors files.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Summary of a checkpoint's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Number of named tensors.
    pub tensors: usize,
    /// Total number of scalar parameters.
    pub parameters: usize,
}

/// Loads a safetensors file and creates a `VarBuilder` over its tensors.
///
/// All tensors are converted to `f32` on access.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The safetensors data is invalid
/// - A tensor has an unsupported dtype
pub fn load_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<VarBuilder<'static>> {
    let path = path.as_ref();
    debug!("Loading safetensors from {}", path.display());

    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;

    let tensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to parse safetensors: {}", path.display()))?;

    let mut tensor_map: HashMap<String, Tensor> = HashMap::new();

    for name in tensors.names() {
        let view = tensors
            .tensor(name)
            .with_context(|| format!("Failed to get tensor '{name}'"))?;

        let dtype = safetensors_dtype_to_candle(view.dtype())?;
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)
            .with_context(|| format!("Failed to create tensor '{name}'"))?;

        tensor_map.insert(name.clone(), tensor);
    }

    debug!(tensors = tensor_map.len(), "Checkpoint loaded");
    Ok(VarBuilder::from_tensors(tensor_map, DType::F32, device))
}

/// Reads only the header of a checkpoint and counts its tensors and parameters.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn inspect_checkpoint(path: impl AsRef<Path>) -> Result<CheckpointInfo> {
    let path = path.as_ref();
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to parse safetensors: {}", path.display()))?;

    let parameters = tensors
        .tensors()
        .iter()
        .map(|(_, view)| view.shape().iter().product::<usize>())
        .sum();

    Ok(CheckpointInfo {
        tensors: tensors.len(),
        parameters,
    })
}

/// Converts safetensors dtype to candle dtype.
fn safetensors_dtype_to_candle(dtype: safetensors::Dtype) -> Result<DType> {
    use safetensors::Dtype as S;
    match dtype {
        S::F32 => Ok(DType::F32),
        S::F64 => Ok(DType::F64),
        S::F16 => Ok(DType::F16),
        S::BF16 => Ok(DType::BF16),
        S::I64 => Ok(DType::I64),
        S::U8 => Ok(DType::U8),
        S::U32 => Ok(DType::U32),
        other => anyhow::bail!("Unsupported dtype: {other:?}"),
    }
}
