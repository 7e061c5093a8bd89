// host.rs — A ComputeDevice that runs on the CPU.
//
// HostDevice exists so the whole pipeline (plan, upload, build, dispatch,
// collect) runs and is testable without an accelerator. It behaves like a
// device in the ways that matter to the convolution core:
//
//   - buffers have a fixed length and start out as NaN, standing in for
//     uninitialised device memory; a read of an unwritten cell shows up
//   - rectangular copies honour both pitches and reject out-of-range rects
//   - `build` parses and validates the real WGSL program with naga
//   - `dispatch` runs the kernel (kernel.rs) for every workgroup,
//     workgroups in parallel on rayon, and only then makes the writes
//     visible, like a blocking finish
//
// It also records what the last dispatch wrote, and can be told to run out
// of memory or to fail a transfer, which the error-path tests use.
//
// NEW RUST CONCEPTS:
// - `RwLock` — many concurrent readers (workgroups reading the input) or one
//   writer (the scatter into the output).
// - `AtomicU64::fetch_update` — lock-free "reserve if it fits" for the
//   memory budget; the reservation is released by `Drop` on the buffer.
// - rayon `map_init` — one tile per worker thread, reused across the
//   workgroups that worker runs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::debug;
use rayon::prelude::*;

use crate::config::{DeviceLimits, DeviceProfile};
use crate::device::{BufferAccess, BufferDesc, ComputeDevice, LaunchShape, Rect};
use crate::error::{ConvolveError, DeviceFault, Result};
use crate::kernel::{
    execute_untiled, execute_workgroup, KernelParams, PixelWrite, TileLoad, INVALID_KERNEL_ARGS, OUT_OF_RANGE,
};
use crate::program::{missing_arg, KernelArg, KernelArgs, KernelProgram, KernelVariant};

/// Device memory exhausted.
pub const MEM_ALLOCATION_FAILURE: i32 = -4;
/// Transfer or resource failure.
pub const OUT_OF_RESOURCES: i32 = -5;
/// Launch shape does not match the kernel's workgroup.
pub const INVALID_WORK_GROUP_SIZE: i32 = -54;
/// Requested buffer is larger than the device allows.
pub const INVALID_BUFFER_SIZE: i32 = -61;

// ---------------------------------------------------------------------------
// Buffers and kernels
// ---------------------------------------------------------------------------

/// A host-resident buffer.
#[derive(Debug)]
pub struct HostBuffer {
    label: &'static str,
    access: BufferAccess,
    data: RwLock<Vec<f32>>,
    lease: MemoryLease,
}

impl HostBuffer {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.lease.bytes as usize / std::mem::size_of::<f32>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents, for inspection in tests.
    pub fn snapshot(&self) -> Vec<f32> {
        match self.data.read() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Bytes held against the device budget; returned on drop.
#[derive(Debug)]
struct MemoryLease {
    bytes: u64,
    used: Arc<AtomicU64>,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// A validated kernel program, ready to dispatch on the host.
#[derive(Debug, Clone)]
pub struct HostKernel {
    variant: KernelVariant,
    workgroup: (u32, u32),
    tile_len: u32,
}

impl HostKernel {
    pub fn variant(&self) -> KernelVariant {
        self.variant
    }
}

/// What the last dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub workgroups: (u32, u32),
    pub work_items: u64,
    /// Output indices written, ascending. Each index appears once per writer.
    pub written: Vec<usize>,
}

// ---------------------------------------------------------------------------
// HostDevice
// ---------------------------------------------------------------------------

/// CPU implementation of [`ComputeDevice`].
#[derive(Debug)]
pub struct HostDevice {
    limits: DeviceLimits,
    memory_limit: u64,
    used: Arc<AtomicU64>,
    transfers: AtomicUsize,
    fail_transfer_after: Option<usize>,
    last_dispatch: Mutex<Option<DispatchRecord>>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::with_limits(DeviceLimits::default())
    }
}

impl HostDevice {
    pub fn new(profile: DeviceProfile) -> Self {
        Self::with_limits(DeviceLimits::for_profile(profile))
    }

    pub fn with_limits(limits: DeviceLimits) -> Self {
        HostDevice {
            limits,
            memory_limit: u64::MAX,
            used: Arc::new(AtomicU64::new(0)),
            transfers: AtomicUsize::new(0),
            fail_transfer_after: None,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Total bytes all live buffers may occupy.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Let `count` transfers succeed, then fail every later one.
    pub fn with_transfer_fault(mut self, count: usize) -> Self {
        self.fail_transfer_after = Some(count);
        self
    }

    /// Bytes currently allocated.
    pub fn memory_in_use(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Transfers issued so far, failed ones included.
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::Acquire)
    }

    pub fn last_dispatch(&self) -> Option<DispatchRecord> {
        match self.last_dispatch.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn begin_transfer(&self, label: &str) -> Result<()> {
        let n = self.transfers.fetch_add(1, Ordering::AcqRel);
        match self.fail_transfer_after {
            Some(limit) if n >= limit => Err(ConvolveError::TransferFailure {
                label: label.to_string(),
                source: DeviceFault::new(OUT_OF_RESOURCES, "device stopped responding"),
            }),
            _ => Ok(()),
        }
    }

    fn reserve(&self, desc: &BufferDesc) -> Result<MemoryLease> {
        let bytes = desc.bytes();
        let alloc_err = |code, message: String| ConvolveError::AllocationFailure {
            label: desc.label.to_string(),
            bytes,
            source: DeviceFault::new(code, message),
        };
        if bytes > self.limits.max_buffer_bytes {
            return Err(alloc_err(
                INVALID_BUFFER_SIZE,
                format!("buffer exceeds the {} byte limit", self.limits.max_buffer_bytes),
            ));
        }
        let limit = self.memory_limit;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= limit)
            })
            .map_err(|used| {
                alloc_err(
                    MEM_ALLOCATION_FAILURE,
                    format!("out of device memory ({used} of {limit} bytes in use)"),
                )
            })?;
        Ok(MemoryLease { bytes, used: Arc::clone(&self.used) })
    }
}

fn transfer_err(buffer: &HostBuffer, message: String) -> ConvolveError {
    ConvolveError::TransferFailure {
        label: buffer.label.to_string(),
        source: DeviceFault::new(OUT_OF_RESOURCES, message),
    }
}

fn dispatch_err(code: i32, message: impl Into<String>) -> ConvolveError {
    ConvolveError::DispatchFailure { source: DeviceFault::new(code, message) }
}

impl ComputeDevice for HostDevice {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;

    fn name(&self) -> String {
        format!("host ({} threads)", rayon::current_num_threads())
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn allocate(&self, desc: &BufferDesc) -> Result<HostBuffer> {
        let lease = self.reserve(desc)?;
        debug!("allocate `{}`: {} elements ({} bytes)", desc.label, desc.len, desc.bytes());
        Ok(HostBuffer {
            label: desc.label,
            access: desc.access,
            data: RwLock::new(vec![f32::NAN; desc.len]),
            lease,
        })
    }

    fn write(&self, buffer: &HostBuffer, data: &[f32]) -> Result<()> {
        self.begin_transfer(buffer.label)?;
        let mut dst = buffer
            .data
            .write()
            .map_err(|_| transfer_err(buffer, "buffer lock poisoned".into()))?;
        if data.len() > dst.len() {
            return Err(transfer_err(
                buffer,
                format!("write of {} elements into a buffer of {}", data.len(), dst.len()),
            ));
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn write_rect(&self, buffer: &HostBuffer, rect: &Rect, data: &[f32]) -> Result<()> {
        self.begin_transfer(buffer.label)?;
        let mut dst = buffer
            .data
            .write()
            .map_err(|_| transfer_err(buffer, "buffer lock poisoned".into()))?;
        check_rect(buffer, rect, dst.len(), data.len())?;
        for y in 0..rect.region.1 {
            let d = rect.buffer_offset(y);
            let s = rect.host_offset(y);
            dst[d..d + rect.region.0].copy_from_slice(&data[s..s + rect.region.0]);
        }
        Ok(())
    }

    fn read(&self, buffer: &HostBuffer, out: &mut [f32]) -> Result<()> {
        self.begin_transfer(buffer.label)?;
        let src = buffer
            .data
            .read()
            .map_err(|_| transfer_err(buffer, "buffer lock poisoned".into()))?;
        if out.len() > src.len() {
            return Err(transfer_err(
                buffer,
                format!("read of {} elements from a buffer of {}", out.len(), src.len()),
            ));
        }
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn read_rect(&self, buffer: &HostBuffer, rect: &Rect, out: &mut [f32]) -> Result<()> {
        self.begin_transfer(buffer.label)?;
        let src = buffer
            .data
            .read()
            .map_err(|_| transfer_err(buffer, "buffer lock poisoned".into()))?;
        check_rect(buffer, rect, src.len(), out.len())?;
        for y in 0..rect.region.1 {
            let s = rect.buffer_offset(y);
            let d = rect.host_offset(y);
            out[d..d + rect.region.0].copy_from_slice(&src[s..s + rect.region.0]);
        }
        Ok(())
    }

    fn build(&self, program: &KernelProgram) -> Result<HostKernel> {
        program.validate()?;
        debug!(
            "built `{}` for {}x{} workgroups, tile of {} cells",
            program.entry_point(),
            program.workgroup().0,
            program.workgroup().1,
            program.tile_len()
        );
        Ok(HostKernel {
            variant: program.variant(),
            workgroup: program.workgroup(),
            tile_len: program.tile_len(),
        })
    }

    fn dispatch(
        &self,
        kernel: &HostKernel,
        args: &KernelArgs<'_, HostBuffer>,
        launch: &LaunchShape,
    ) -> Result<()> {
        if launch.local != kernel.workgroup {
            return Err(dispatch_err(
                INVALID_WORK_GROUP_SIZE,
                format!(
                    "launch local size {:?} differs from the program's workgroup {:?}",
                    launch.local, kernel.workgroup
                ),
            ));
        }
        if launch.global.0 % launch.local.0 != 0 || launch.global.1 % launch.local.1 != 0 {
            return Err(dispatch_err(
                INVALID_WORK_GROUP_SIZE,
                format!("global size {:?} is not a multiple of {:?}", launch.global, launch.local),
            ));
        }

        let params = KernelParams::from_args(args)
            .map_err(|source| ConvolveError::DispatchFailure { source })?;
        let variant = kernel.variant;
        let tiled = variant.uses_tile();
        let tile_bytes = kernel.tile_len * std::mem::size_of::<f32>() as u32;
        if tiled && args.local_bytes() != Some(tile_bytes) {
            return Err(dispatch_err(
                INVALID_KERNEL_ARGS,
                format!("`tile` bound to {:?} bytes, program declares {tile_bytes}", args.local_bytes()),
            ));
        }

        let (input_arg, load) = if variant.loads_quads() {
            (KernelArg::InputImageQuads, TileLoad::Quad)
        } else {
            (KernelArg::InputImage, TileLoad::Scalar)
        };
        let lookup = |arg| {
            args.buffer(arg)
                .ok_or_else(|| dispatch_err(INVALID_KERNEL_ARGS, missing_arg(variant, arg)))
        };
        let input = lookup(input_arg)?;
        let output = lookup(KernelArg::OutputImage)?;
        let filter = lookup(KernelArg::Filter)?;
        if !output.access.kernel_can_write() {
            return Err(dispatch_err(
                INVALID_KERNEL_ARGS,
                format!("`{}` is read-only to kernels", output.label),
            ));
        }

        let (groups_x, groups_y) = launch.groups();
        let groups: Vec<(u32, u32)> =
            (0..groups_y).flat_map(|gy| (0..groups_x).map(move |gx| (gx, gy))).collect();

        // Run every workgroup against the read-only inputs. Guards drop at
        // the end of this block, before the output is locked for writing.
        let per_group: Vec<Vec<PixelWrite>> = {
            let input_data = input.data.read().map_err(|_| dispatch_err(OUT_OF_RESOURCES, "input lock poisoned"))?;
            let coeffs = filter.data.read().map_err(|_| dispatch_err(OUT_OF_RESOURCES, "filter lock poisoned"))?;
            let workgroup = kernel.workgroup;
            let tile_len = kernel.tile_len as usize;
            let per_group = groups
                .par_iter()
                .map_init(
                    || vec![f32::NAN; tile_len],
                    |tile, &group| {
                        let mut writes = Vec::new();
                        let done = if tiled {
                            execute_workgroup(&params, load, workgroup, group, &input_data, &coeffs, tile, &mut writes)
                        } else {
                            execute_untiled(&params, workgroup, group, &input_data, &coeffs, &mut writes)
                        };
                        done.map(|()| writes)
                    },
                )
                .collect::<std::result::Result<Vec<_>, DeviceFault>>()
                .map_err(|source| ConvolveError::DispatchFailure { source })?;
            per_group
        };

        // Finish: make the writes visible.
        let mut out = output.data.write().map_err(|_| dispatch_err(OUT_OF_RESOURCES, "output lock poisoned"))?;
        let mut written = Vec::with_capacity(per_group.iter().map(Vec::len).sum());
        for w in per_group.iter().flatten() {
            let len = out.len();
            let cell = out.get_mut(w.index).ok_or_else(|| {
                dispatch_err(OUT_OF_RANGE, format!("write to `image_out`[{}] past its {len} elements", w.index))
            })?;
            *cell = w.value;
            written.push(w.index);
        }
        written.sort_unstable();

        let record = DispatchRecord {
            workgroups: (groups_x, groups_y),
            work_items: launch.global.0 as u64 * launch.global.1 as u64,
            written,
        };
        debug!(
            "dispatched `{}`: {}x{} groups, {} writes",
            variant,
            groups_x,
            groups_y,
            record.written.len()
        );
        match self.last_dispatch.lock() {
            Ok(mut guard) => *guard = Some(record),
            Err(poisoned) => *poisoned.into_inner() = Some(record),
        }
        Ok(())
    }
}

fn check_rect(buffer: &HostBuffer, rect: &Rect, buffer_len: usize, host_len: usize) -> Result<()> {
    if rect.region.0 > rect.buffer_pitch || rect.region.0 > rect.host_pitch {
        return Err(transfer_err(
            buffer,
            format!("rect width {} exceeds a row pitch", rect.region.0),
        ));
    }
    if rect.buffer_extent() > buffer_len {
        return Err(transfer_err(
            buffer,
            format!("rect reaches element {} of a {buffer_len}-element buffer", rect.buffer_extent()),
        ));
    }
    if rect.host_extent() > host_len {
        return Err(transfer_err(
            buffer,
            format!("rect reaches element {} of a {host_len}-element host plane", rect.host_extent()),
        ));
    }
    Ok(())
}
