// device.rs — The compute-dispatch capability the convolution core runs on.
//
// `ComputeDevice` is the seam between the core (planner, buffer manager,
// collector) and an actual executor. Two implementations live in this
// crate:
//
//   host::HostDevice     — runs the kernel on the CPU, work-item faithful
//   gpu::GpuDevice       — wgpu compute pipelines
//
// The trait is deliberately close to the primitives a data-parallel runtime
// offers: allocate a buffer with an access pattern, copy to/from it either
// contiguously or as a rectangle of rows, build a program from text, bind
// arguments, dispatch and wait. Every call is blocking. Once a method
// returns, its effect is visible to the next call. There is no timeout: a
// device that never completes blocks the caller.

use crate::config::DeviceLimits;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::program::{KernelArgs, KernelProgram};

/// How the kernel uses a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BufferAccess {
    pub fn kernel_can_write(self) -> bool {
        !matches!(self, BufferAccess::ReadOnly)
    }
}

/// Allocation request. Lengths are in f32 elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub len: usize,
    pub access: BufferAccess,
}

impl BufferDesc {
    pub fn bytes(&self) -> u64 {
        (self.len * std::mem::size_of::<f32>()) as u64
    }
}

/// A rectangle of rows copied between a pitched host plane and a pitched
/// device buffer. Origins are `(column, row)`; every quantity is in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub buffer_origin: (usize, usize),
    pub host_origin: (usize, usize),
    /// `(columns, rows)` copied.
    pub region: (usize, usize),
    pub buffer_pitch: usize,
    pub host_pitch: usize,
}

impl Rect {
    /// Offset of row `y` of the region inside the device buffer.
    #[inline]
    pub fn buffer_offset(&self, y: usize) -> usize {
        (self.buffer_origin.1 + y) * self.buffer_pitch + self.buffer_origin.0
    }

    /// Offset of row `y` of the region inside the host plane.
    #[inline]
    pub fn host_offset(&self, y: usize) -> usize {
        (self.host_origin.1 + y) * self.host_pitch + self.host_origin.0
    }

    /// One past the last device element touched.
    pub fn buffer_extent(&self) -> usize {
        if self.region.0 == 0 || self.region.1 == 0 {
            return 0;
        }
        self.buffer_offset(self.region.1 - 1) + self.region.0
    }

    /// One past the last host element touched.
    pub fn host_extent(&self) -> usize {
        if self.region.0 == 0 || self.region.1 == 0 {
            return 0;
        }
        self.host_offset(self.region.1 - 1) + self.region.0
    }
}

/// Dispatch shape in work-items: `global` is a whole multiple of `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchShape {
    pub global: (u32, u32),
    pub local: (u32, u32),
}

impl LaunchShape {
    pub fn from_geometry(geometry: &Geometry) -> Self {
        LaunchShape {
            global: (geometry.dispatch_width, geometry.dispatch_height),
            local: (geometry.workgroup.width, geometry.workgroup.height),
        }
    }

    /// Workgroups along x and y.
    pub fn groups(&self) -> (u32, u32) {
        (self.global.0 / self.local.0, self.global.1 / self.local.1)
    }
}

/// The three buffers of one pass. Scoped to a single convolution.
#[derive(Debug)]
pub struct DeviceBuffers<B> {
    pub input: B,
    pub output: B,
    pub filter: B,
}

/// A data-parallel executor.
pub trait ComputeDevice {
    type Buffer;
    type Kernel;

    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// Limits plans are checked against before any allocation.
    fn limits(&self) -> DeviceLimits;

    /// Reserve device memory. Contents are unspecified until written.
    fn allocate(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Copy `data` to the start of `buffer`.
    fn write(&self, buffer: &Self::Buffer, data: &[f32]) -> Result<()>;

    /// Copy a rectangle of rows from the host plane `data` into `buffer`.
    fn write_rect(&self, buffer: &Self::Buffer, rect: &Rect, data: &[f32]) -> Result<()>;

    /// Copy the start of `buffer` into `out`, filling all of it.
    fn read(&self, buffer: &Self::Buffer, out: &mut [f32]) -> Result<()>;

    /// Copy a rectangle of rows from `buffer` into the host plane `out`.
    fn read_rect(&self, buffer: &Self::Buffer, rect: &Rect, out: &mut [f32]) -> Result<()>;

    /// Compile an instantiated kernel program.
    fn build(&self, program: &KernelProgram) -> Result<Self::Kernel>;

    /// Run `kernel` over `launch` with the bound arguments and wait for it.
    fn dispatch(
        &self,
        kernel: &Self::Kernel,
        args: &KernelArgs<'_, Self::Buffer>,
        launch: &LaunchShape,
    ) -> Result<()>;
}

/// A shared device is a device: several `Convolver`s can borrow one context.
impl<D: ComputeDevice + ?Sized> ComputeDevice for &D {
    type Buffer = D::Buffer;
    type Kernel = D::Kernel;

    fn name(&self) -> String {
        (**self).name()
    }

    fn limits(&self) -> DeviceLimits {
        (**self).limits()
    }

    fn allocate(&self, desc: &BufferDesc) -> Result<Self::Buffer> {
        (**self).allocate(desc)
    }

    fn write(&self, buffer: &Self::Buffer, data: &[f32]) -> Result<()> {
        (**self).write(buffer, data)
    }

    fn write_rect(&self, buffer: &Self::Buffer, rect: &Rect, data: &[f32]) -> Result<()> {
        (**self).write_rect(buffer, rect, data)
    }

    fn read(&self, buffer: &Self::Buffer, out: &mut [f32]) -> Result<()> {
        (**self).read(buffer, out)
    }

    fn read_rect(&self, buffer: &Self::Buffer, rect: &Rect, out: &mut [f32]) -> Result<()> {
        (**self).read_rect(buffer, rect, out)
    }

    fn build(&self, program: &KernelProgram) -> Result<Self::Kernel> {
        (**self).build(program)
    }

    fn dispatch(
        &self,
        kernel: &Self::Kernel,
        args: &KernelArgs<'_, Self::Buffer>,
        launch: &LaunchShape,
    ) -> Result<()> {
        (**self).dispatch(kernel, args, launch)
    }
}
