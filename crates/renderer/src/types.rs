use kernel::DeviceLimits;

/// Warp width assumed when the vendor is not recognised.
pub const FALLBACK_EXECUTION_WIDTH: u32 = 32;

const VENDOR_AMD: u32 = 0x1002;
const VENDOR_APPLE: u32 = 0x106B;
const VENDOR_INTEL: u32 = 0x8086;
const VENDOR_NVIDIA: u32 = 0x10DE;

/// Adapter preference passed to `wgpu` when picking a GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPowerPreference {
    Low,
    #[default]
    High,
}

impl GpuPowerPreference {
    pub(crate) fn to_wgpu(self) -> wgpu::PowerPreference {
        match self {
            GpuPowerPreference::Low => wgpu::PowerPreference::LowPower,
            GpuPowerPreference::High => wgpu::PowerPreference::HighPerformance,
        }
    }
}

/// Device selection knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuOptions {
    pub power: GpuPowerPreference,
    /// Overrides the execution width guessed from the adapter vendor.
    pub execution_width: Option<u32>,
}

/// What we know about the adapter we ended up on.
#[derive(Clone, Debug)]
pub struct AdapterProfile {
    pub name: String,
    pub vendor: u32,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
    pub driver: String,
}

impl AdapterProfile {
    pub fn from_wgpu(info: &wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name.clone(),
            vendor: info.vendor,
            backend: info.backend,
            device_type: info.device_type,
            driver: info.driver.clone(),
        }
    }

    /// Software rasterizers (llvmpipe, lavapipe, SwiftShader, WARP).
    pub fn is_software(&self) -> bool {
        if self.device_type == wgpu::DeviceType::Cpu {
            return true;
        }
        let name = self.name.to_ascii_lowercase();
        ["llvmpipe", "lavapipe", "swiftshader", "softpipe", "basic render"]
            .iter()
            .any(|needle| name.contains(needle))
    }

    /// Lanes per SIMD group, guessed from the vendor.
    pub fn execution_width(&self) -> u32 {
        if self.is_software() {
            return 4;
        }
        match self.vendor {
            VENDOR_NVIDIA | VENDOR_APPLE => 32,
            VENDOR_AMD => 64,
            VENDOR_INTEL => 16,
            _ => FALLBACK_EXECUTION_WIDTH,
        }
    }
}

/// Compute limits of a device in the partitioner's terms.
pub fn device_limits(limits: &wgpu::Limits, execution_width: u32) -> DeviceLimits {
    DeviceLimits {
        max_threads_per_group: limits.max_compute_invocations_per_workgroup,
        execution_width: execution_width.max(1),
        max_group_width: limits.max_compute_workgroup_size_x,
        max_group_height: limits.max_compute_workgroup_size_y,
        max_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
    }
}
