//! ML inference engine using Candle.
//!
//! Provides checkpoint loading and the glaucoma classifier:
//! - MobileNetV3-Large feature stack (BatchNorm folded at load time)
//! - spatial soft attention
//! - three-layer classification head

mod attention;
mod classifier;
mod device;
mod layers;
mod loader;
mod mobilenet;
mod utils;

pub use attention::SpatialAttention;
pub use classifier::{GlaucomaNet, TargetLayer};
pub use device::{device_for, get_device};
pub use layers::{hardsigmoid, hardswish};
pub use loader::{inspect_checkpoint, load_safetensors, CheckpointInfo};
pub use mobilenet::{MobileNetV3Features, FEATURE_CHANNELS};
pub use utils::{argmax, softmax};
