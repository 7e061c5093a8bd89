// gpu/device.rs — wgpu adapter and device acquisition.
//
// Responsibilities:
//   - Enumerate adapters and select real hardware over software renderers.
//   - Request a device with limits taken from a `DeviceProfile`, so a
//     geometry that would be rejected on a Raspberry Pi is also rejected on
//     the development machine.
//   - Report the granted limits as `DeviceLimits` for the planner.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` may grab llvmpipe/lavapipe where a
// software renderer appears as a valid Vulkan device (WSL2, CI). We
// enumerate explicitly and take, in order:
//   1. DiscreteGpu / IntegratedGpu / VirtualGpu / Other
//   2. anything at all, with a warning naming the adapter
//
// DEVICE LIMITS:
// Under a non-Native profile we request *lower* limits than the hardware
// supports. wgpu validates every pipeline and dispatch against the
// requested limits, so violations surface on the laptop as validation
// errors instead of crashes on the target.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's adapter/device API is async because on WebGPU it maps to
//   JS Promises; natively we just block.
// - `thiserror` — derives `Display` and `Error` for `GpuError`; `#[source]`
//   keeps the wgpu error reachable through `Error::source()`.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{DeviceLimits, DeviceProfile};

/// Cached adapter information for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(info: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type,
            backend: info.backend,
        }
    }
}

/// The GPU context: device, queue and the profile it was created under.
///
/// Expensive to create (instance + device initialisation); hold one for the
/// lifetime of the application.
///
/// # Field drop order
/// Fields drop top to bottom. `_instance` is declared last so the
/// `wgpu::Instance` outlives `device` and `queue`; some Vulkan layers
/// (dzn on WSL2) crash if the instance goes first.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// First hardware adapter, `DeviceProfile::Native` limits.
    ///
    /// # Errors
    /// `NoSuitableAdapter` if nothing is enumerated, `DeviceRequest` if the
    /// adapter refuses the requested limits.
    pub fn new() -> Result<Self, GpuError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    /// Create a device with an explicit hardware profile.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, GpuError> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        for a in &adapters {
            let info = a.get_info();
            debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        let mut hardware = None;
        let mut fallback = None;
        for a in adapters {
            if is_hardware(a.get_info().device_type) {
                hardware = Some(a);
                break;
            }
            fallback.get_or_insert(a);
        }
        let adapter = match (hardware, fallback) {
            (Some(a), _) => a,
            (None, Some(a)) => {
                warn!("no hardware adapter found, falling back to {}", a.get_info().name);
                a
            }
            (None, None) => return Err(GpuError::NoSuitableAdapter),
        };

        let adapter_info = AdapterInfo::from(adapter.get_info());

        // A V3D adapter under the Native profile gets the Pi limits anyway.
        let profile = match profile {
            DeviceProfile::Native if adapter_info.name.to_ascii_lowercase().contains("v3d") => {
                info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tiled-conv"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        info!("GPU device: {adapter_info}, profile {profile}");
        Ok(GpuDevice { device, queue, profile, adapter_info, _instance: instance })
    }

    /// The granted limits, in the planner's terms.
    pub fn device_limits(&self) -> DeviceLimits {
        device_limits(&self.device.limits())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {}, profile: {} }}", self.adapter_info, self.profile)
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("adapter_info", &self.adapter_info)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

fn is_hardware(device_type: wgpu::DeviceType) -> bool {
    matches!(
        device_type,
        wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu
            | wgpu::DeviceType::Other
    )
}

// ============================================================
// Limits helpers
// ============================================================

/// wgpu limits requested for a profile.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    let planned = DeviceLimits::for_profile(profile);
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),
        DeviceProfile::RaspberryPi => wgpu::Limits {
            max_compute_invocations_per_workgroup: planned.max_workgroup_invocations,
            max_compute_workgroup_size_x: planned.max_workgroup_width,
            max_compute_workgroup_size_y: planned.max_workgroup_height,
            max_compute_workgroup_size_z: 64,
            max_compute_workgroup_storage_size: planned.max_shared_bytes,
            max_storage_buffer_binding_size: planned.max_buffer_bytes as u32,
            max_buffer_size: planned.max_buffer_bytes,
            ..wgpu::Limits::default()
        },
    }
}

/// Map wgpu limits onto the subset the planner checks. A buffer must be
/// both creatable and bindable as storage.
pub(crate) fn device_limits(limits: &wgpu::Limits) -> DeviceLimits {
    DeviceLimits {
        max_workgroup_invocations: limits.max_compute_invocations_per_workgroup,
        max_workgroup_width: limits.max_compute_workgroup_size_x,
        max_workgroup_height: limits.max_compute_workgroup_size_y,
        max_shared_bytes: limits.max_compute_workgroup_storage_size,
        max_buffer_bytes: limits.max_buffer_size.min(limits.max_storage_buffer_binding_size as u64),
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialisation.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Nothing enumerated on the primary backends.
    #[error("no GPU adapter found on Vulkan, Metal or DX12")]
    NoSuitableAdapter,
    /// Driver refused the device, usually over unsupported limits.
    #[error("device request failed")]
    DeviceRequest(#[source] wgpu::RequestDeviceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpi_limits_follow_profile() {
        let limits = limits_for_profile(DeviceProfile::RaspberryPi);
        assert_eq!(limits.max_compute_invocations_per_workgroup, 256);
        assert_eq!(limits.max_compute_workgroup_storage_size, 16384);
        assert_eq!(limits.max_storage_buffer_binding_size, 128 << 20);
        assert_eq!(device_limits(&limits), DeviceLimits::for_profile(DeviceProfile::RaspberryPi));
    }

    #[test]
    fn test_native_limits_are_default() {
        assert_eq!(limits_for_profile(DeviceProfile::Native), wgpu::Limits::default());
        let planned = device_limits(&wgpu::Limits::default());
        assert_eq!(planned.max_workgroup_invocations, 256);
        assert_eq!(planned.max_shared_bytes, 16384);
    }

    #[test]
    fn test_software_adapters_are_fallback_only() {
        assert!(is_hardware(wgpu::DeviceType::DiscreteGpu));
        assert!(is_hardware(wgpu::DeviceType::IntegratedGpu));
        assert!(!is_hardware(wgpu::DeviceType::Cpu));
    }

    #[test]
    #[ignore = "requires a GPU adapter"]
    fn test_gpu_device_init() {
        let gpu = GpuDevice::new().expect("should initialise a GPU device");
        assert!(gpu.device_limits().max_workgroup_invocations >= 256);
    }
}
