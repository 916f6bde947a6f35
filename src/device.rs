//! Compute device selection

use candle_core::Device;
use tracing::{info, warn};

/// Select the best available compute device
///
/// Prefers CUDA, then Metal, then CPU. The choice depends only on host
/// capability, never on job configuration, so the same job file runs
/// unchanged on any machine.
pub fn select_device() -> Device {
    if candle_core::utils::cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA device 0");
                return device;
            }
            Err(e) => warn!("CUDA reported available but failed to initialize: {e}"),
        }
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal device 0");
                return device;
            }
            Err(e) => warn!("Metal reported available but failed to initialize: {e}"),
        }
    }
    info!("Using CPU");
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_deterministic() {
        let first = select_device();
        let second = select_device();
        assert!(first.same_device(&second));
    }
}
