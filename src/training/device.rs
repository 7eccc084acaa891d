//! Compute device selection

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Which device the encoder should run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("CUDA initialization failed: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_device() -> Option<Device> {
    None
}

#[cfg(feature = "metal")]
fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("Metal initialization failed: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "metal"))]
fn metal_device() -> Option<Device> {
    None
}

/// Select a device based on preference, falling back to CPU
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cuda => cuda_device().or_else(|| {
            if !cfg!(feature = "cuda") {
                tracing::warn!("CUDA requested but not compiled with 'cuda' feature");
            }
            None
        }),
        DevicePreference::Metal => metal_device().or_else(|| {
            if !cfg!(feature = "metal") {
                tracing::warn!("Metal requested but not compiled with 'metal' feature");
            }
            None
        }),
        DevicePreference::Cpu => Some(Device::Cpu),
        DevicePreference::Auto => cuda_device().or_else(metal_device),
    };

    match device {
        Some(device) => {
            tracing::info!("Using device: {}", device_name(&device));
            Ok(device)
        }
        None => {
            if preference != DevicePreference::Auto {
                tracing::warn!("Falling back to CPU");
            }
            tracing::info!("Using device: cpu");
            Ok(Device::Cpu)
        }
    }
}

/// Short human-readable device name
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Availability of each backend, in preference order
pub fn available_devices() -> Vec<(&'static str, bool, &'static str)> {
    let cuda = if cfg!(feature = "cuda") {
        (cuda_device().is_some(), "")
    } else {
        (false, "not compiled (use --features cuda)")
    };
    let metal = if cfg!(feature = "metal") {
        (metal_device().is_some(), "")
    } else {
        (false, "not compiled (use --features metal)")
    };

    vec![
        ("cuda", cuda.0, cuda.1),
        ("metal", metal.0, metal.1),
        ("cpu", true, ""),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_from_str() {
        assert_eq!(
            "cuda".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cuda
        );
        assert_eq!(
            "GPU".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cuda
        );
        assert_eq!(
            "cpu".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cpu
        );
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_cpu_always_available() {
        let device = select_device(DevicePreference::Cpu).unwrap();
        assert!(matches!(device, Device::Cpu));
        assert!(available_devices()
            .iter()
            .any(|(name, ok, _)| *name == "cpu" && *ok));
    }

    #[test]
    fn test_device_preference_serde() {
        let pref: DevicePreference = serde_json::from_str("\"metal\"").unwrap();
        assert_eq!(pref, DevicePreference::Metal);
        assert_eq!(DevicePreference::Auto.to_string(), "auto");
    }
}
