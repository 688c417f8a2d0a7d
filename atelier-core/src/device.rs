use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DevicePreference {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Pick the best available device: CUDA, then Metal, then CPU. The choice
/// is made once per manager and applied to every model it loads.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::ForceCpu => Ok(Device::Cpu),
        DevicePreference::Ordinal(ordinal) if cuda_is_available() => {
            Ok(Device::new_cuda(ordinal)?)
        }
        DevicePreference::Ordinal(ordinal) if metal_is_available() => {
            Ok(Device::new_metal(ordinal)?)
        }
        DevicePreference::Ordinal(_) => {
            info!("no accelerator available, running on CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Half precision on accelerators, full precision on CPU.
pub fn preferred_dtype(device: &Device) -> DType {
    if matches!(device, Device::Cpu) {
        DType::F32
    } else {
        DType::F16
    }
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
