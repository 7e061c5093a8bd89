// gpu/mod.rs — wgpu compute backend.
//
// `GpuDevice` implements `ComputeDevice`, so the same `Convolver` that runs
// on the host device runs here unchanged. The host device stays the
// reference: every GPU result is checked against it (tests/test_gpu.rs).
//
//   device.rs    adapter selection, profile limits, GpuDevice
//   compute.rs   buffers, pipelines, dispatch

pub mod compute;
pub mod device;

pub use compute::{GpuBuffer, GpuKernel};
pub use device::{AdapterInfo, GpuDevice, GpuError};
