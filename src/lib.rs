// tiled-conv: tiled 2D convolution on a data-parallel device
//
// Single-channel f32 images, odd square filters, workgroups that cache a
// padded tile in shared memory. Three global-memory access strategies
// (naive, aligned, vectorized) behind one interface. Runs on the GPU through
// wgpu, or on the host device, which executes the same kernel work-item by
// work-item and needs no accelerator.
//
// Stage order for one pass:
//   geometry → transfer (upload) → program/kernel (dispatch) → collector

pub mod error;
pub mod image;
pub mod filter;
pub mod convolution;
pub mod geometry;
pub mod config;

pub mod program;
pub mod device;
pub mod transfer;
pub mod kernel;
pub mod host;
pub mod collector;
pub mod pipeline;

pub mod gpu;

pub use config::{BorderFill, ConvolveConfig, DeviceLimits, DeviceProfile, KernelMemory};
pub use device::ComputeDevice;
pub use error::{ConvolveError, DeviceFault, Result};
pub use filter::Filter;
pub use geometry::{AccessStrategy, Geometry, WorkgroupShape};
pub use host::HostDevice;
pub use image::Image;
pub use pipeline::{convolve, Convolver};
