//! # Device Selection
//!
//! Picks the compute device the Whisper engine runs on. GPU backends fall back to
//! the CPU when they are not available in this build or on this machine.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached result of auto-detection
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Device preference from `engine.device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Best available device
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU 0, falling back to CPU
    Cuda,
    /// Metal GPU 0, falling back to CPU
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// Resolve a preference to a concrete device.
pub fn select_device(preference: DevicePreference) -> Device {
    match preference {
        DevicePreference::Auto => BEST_DEVICE.get_or_init(detect_best_device).clone(),
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

/// Resolve a configured device string; unknown values mean `auto`.
pub fn device_from_config(value: &str) -> Device {
    let preference = value.parse().unwrap_or_else(|e| {
        warn!("{}, using auto", e);
        DevicePreference::Auto
    });
    let device = select_device(preference);
    info!("Inference device: {}", device_label(&device));
    device
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

fn detect_best_device() -> Device {
    if let Some(device) = cuda_device() {
        return device;
    }
    if let Some(device) = metal_device() {
        return device;
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_is_always_available() {
        let device = select_device(DevicePreference::Cpu);
        assert_eq!(device_label(&device), "cpu");
    }

    #[test]
    fn test_unknown_config_value_still_yields_device() {
        let device = device_from_config("quantum");
        assert!(!device_label(&device).is_empty());
    }
}
