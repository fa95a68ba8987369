//! Device selection and the mixed-precision policy.

use candle_core::{DType, Device};
use recyclebot_core::{DeviceConfig, DeviceKind, Precision};

/// The device and compute dtype the model runs with.
#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: Device,
    /// Backbone compute dtype. Variables, loss and softmax stay in F32.
    pub dtype: DType,
}

impl DeviceSelection {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    pub fn describe(&self) -> String {
        let device = match &self.device {
            Device::Cpu => "cpu".to_string(),
            Device::Cuda(_) => "cuda".to_string(),
            Device::Metal(_) => "metal".to_string(),
        };
        format!("{device} ({:?})", self.dtype)
    }
}

/// Pick the device and dtype described by `config`.
///
/// Accelerator setup failures never abort: they are logged and the CPU is used.
pub fn select_device(config: &DeviceConfig) -> DeviceSelection {
    let device = match config.kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => cuda_or_cpu(config.ordinal),
        DeviceKind::Metal => metal_or_cpu(config.ordinal),
        DeviceKind::Auto => {
            if candle_core::utils::cuda_is_available() {
                cuda_or_cpu(config.ordinal)
            } else if candle_core::utils::metal_is_available() {
                metal_or_cpu(config.ordinal)
            } else {
                Device::Cpu
            }
        }
    };

    if !device.is_cpu() {
        if let Err(e) = device.set_seed(config.seed) {
            tracing::debug!(error = %e, "Could not seed accelerator RNG");
        }
    }

    let dtype = compute_dtype(config.precision, &device);
    let selection = DeviceSelection { device, dtype };
    tracing::info!(device = %selection.describe(), "Device selected");
    selection
}

/// Resolve the precision policy for a device.
pub fn compute_dtype(precision: Precision, device: &Device) -> DType {
    match (precision, device.is_cpu()) {
        (Precision::F32, _) => DType::F32,
        (Precision::MixedF16 | Precision::MixedBf16, true) => {
            tracing::warn!("Mixed precision is not supported on CPU, using f32");
            DType::F32
        }
        (Precision::MixedF16, false) => DType::F16,
        (Precision::MixedBf16, false) => DType::BF16,
    }
}

fn cuda_or_cpu(ordinal: usize) -> Device {
    match Device::new_cuda(ordinal) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!(ordinal, error = %e, "CUDA device unavailable, falling back to CPU");
            Device::Cpu
        }
    }
}

fn metal_or_cpu(ordinal: usize) -> Device {
    match Device::new_metal(ordinal) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!(ordinal, error = %e, "Metal device unavailable, falling back to CPU");
            Device::Cpu
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_selection_is_f32() {
        let config = DeviceConfig {
            kind: DeviceKind::Cpu,
            precision: Precision::MixedF16,
            ..Default::default()
        };
        let selection = select_device(&config);
        assert!(selection.device.is_cpu());
        assert_eq!(selection.dtype, DType::F32);
        assert_eq!(selection.describe(), "cpu (F32)");
    }

    #[test]
    fn test_precision_policy() {
        assert_eq!(compute_dtype(Precision::F32, &Device::Cpu), DType::F32);
        assert_eq!(compute_dtype(Precision::MixedBf16, &Device::Cpu), DType::F32);
    }
}
