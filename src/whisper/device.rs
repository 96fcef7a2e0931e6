//! # Compute Device Selection
//!
//! Picks the candle device Whisper runs on. GPUs are preferred when asked
//! for (or when `auto` finds one); everything falls back to the CPU.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

static DETECTED_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(anyhow::anyhow!("Unknown device preference: {}", s)),
        }
    }
}

pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Auto => DETECTED_DEVICE.get_or_init(detect_device).clone(),
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => cuda_device().unwrap_or_else(|| {
            warn!("CUDA requested but not available, using CPU");
            Device::Cpu
        }),
        DevicePreference::Metal => metal_device().unwrap_or_else(|| {
            warn!("Metal requested but not available, using CPU");
            Device::Cpu
        }),
    }
}

fn detect_device() -> Device {
    if let Some(device) = cuda_device() {
        info!("Selected CUDA GPU for inference");
        return device;
    }
    if let Some(device) = metal_device() {
        info!("Selected Metal GPU for inference");
        return device;
    }
    info!("Using CPU for inference");
    Device::Cpu
}

fn cuda_device() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| debug!("CUDA not available: {}", e))
        .ok()
}

fn metal_device() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| debug!("Metal not available: {}", e))
        .ok()
}

pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_parsing() {
        assert_eq!("AUTO".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_preference_is_cpu() {
        assert_eq!(describe(&select_device(DevicePreference::Cpu)), "cpu");
    }
}
