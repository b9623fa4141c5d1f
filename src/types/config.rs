//! Configuration types
//!
//! Device selection, resolved once at startup and passed to the engine.

use serde::{Deserialize, Serialize};

/// Device requested in the settings file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use a GPU backend when one was compiled in
    #[default]
    Auto,
    /// Always run on the CPU
    Cpu,
    /// Offload to the GPU (falls back to CPU without a GPU backend)
    Gpu,
}

/// The device inference actually runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu {
        /// Name of the llama.cpp backend feature ("cuda", "metal", "vulkan")
        backend: &'static str,
        /// Number of layers offloaded to the GPU
        layers: u32,
    },
}

impl Device {
    /// Resolve the preference against the backends this binary was built with
    pub fn resolve(preference: DevicePreference, gpu_layers: u32) -> Self {
        Self::resolve_with(preference, gpu_layers, compiled_gpu_backend())
    }

    fn resolve_with(
        preference: DevicePreference,
        gpu_layers: u32,
        backend: Option<&'static str>,
    ) -> Self {
        match (preference, backend) {
            (DevicePreference::Cpu, _) => Device::Cpu,
            (_, Some(backend)) if gpu_layers > 0 => Device::Gpu {
                backend,
                layers: gpu_layers,
            },
            (DevicePreference::Gpu, None) => {
                tracing::warn!("GPU requested but no GPU backend compiled in, using CPU");
                Device::Cpu
            }
            _ => Device::Cpu,
        }
    }

    /// Layers to offload when loading the model (0 = CPU only)
    pub fn gpu_layers(&self) -> u32 {
        match self {
            Device::Cpu => 0,
            Device::Gpu { layers, .. } => *layers,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu { backend, layers } => write!(f, "{} ({} layers)", backend, layers),
        }
    }
}

fn compiled_gpu_backend() -> Option<&'static str> {
    if cfg!(feature = "cuda") {
        Some("cuda")
    } else if cfg!(feature = "metal") {
        Some("metal")
    } else if cfg!(feature = "vulkan") {
        Some("vulkan")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference_ignores_backend() {
        let device = Device::resolve_with(DevicePreference::Cpu, 99, Some("cuda"));
        assert_eq!(device, Device::Cpu);
        assert_eq!(device.gpu_layers(), 0);
    }

    #[test]
    fn test_auto_uses_compiled_backend() {
        let device = Device::resolve_with(DevicePreference::Auto, 99, Some("metal"));
        assert_eq!(
            device,
            Device::Gpu {
                backend: "metal",
                layers: 99
            }
        );
        assert_eq!(device.gpu_layers(), 99);

        let device = Device::resolve_with(DevicePreference::Auto, 99, None);
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_gpu_without_backend_falls_back() {
        let device = Device::resolve_with(DevicePreference::Gpu, 99, None);
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_zero_layers_is_cpu() {
        let device = Device::resolve_with(DevicePreference::Gpu, 0, Some("cuda"));
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_preference_serialization() {
        let json = serde_json::to_string(&DevicePreference::Gpu).expect("Failed to serialize");
        assert_eq!(json, "\"gpu\"");
        let parsed: DevicePreference =
            serde_json::from_str("\"auto\"").expect("Failed to deserialize");
        assert_eq!(parsed, DevicePreference::Auto);
    }
}
