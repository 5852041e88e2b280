//! Device selection for inference.

use candle_core::Device;
use tracing::info;

/// Returns the best available device for inference.
///
/// Uses a GPU (Metal on macOS, CUDA elsewhere) when the crate is built with
/// the matching feature and a device is present, otherwise the CPU.
#[must_use]
pub fn get_device() -> Device {
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("Using Metal device for inference");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("Using CUDA device for inference");
            return device;
        }
    }

    info!("Using CPU for inference");
    Device::Cpu
}

/// Resolves a configured device name: `cpu` forces the CPU, anything else
/// (normally `auto`) picks the best available device.
#[must_use]
pub fn device_for(name: &str) -> Device {
    if name.eq_ignore_ascii_case("cpu") {
        info!("Using CPU for inference (configured)");
        Device::Cpu
    } else {
        get_device()
    }
}
