// gpu/compute.rs — ComputeDevice over wgpu.
//
// Maps the trait's primitives onto wgpu:
//
//   allocate     storage buffer, STORAGE | COPY_DST | COPY_SRC
//   write        queue.write_buffer, then submit + poll(Wait)
//   write_rect   one write_buffer per row at the row's pitched offset
//   read         copy into a MAP_READ staging buffer, map, poll(Wait)
//   read_rect    one copy per row into a compact staging buffer
//   build        shader module + bind group layout derived from the
//                variant's argument table + compute pipeline
//   dispatch     bind buffers and the `Params` uniform, dispatch the
//                geometry's workgroup grid, submit, poll(Wait)
//
// ERRORS:
// wgpu reports validation and out-of-memory errors asynchronously through
// the device's uncaptured-error handler unless an error scope is pushed.
// Every fallible call here runs inside a scope and the popped error becomes
// the matching ConvolveError variant. wgpu errors carry no numeric code, so
// DeviceFault::code is None.
//
// SYNCHRONISATION:
// Each primitive ends with `device.poll(Maintain::Wait)`, so when it returns
// the GPU has finished the work. This is the blocking model the pipeline
// assumes: upload completes before dispatch, dispatch completes before
// readback. A hung GPU hangs the poll.

use log::{debug, warn};
use wgpu::util::DeviceExt;

use crate::config::DeviceLimits;
use crate::device::{BufferDesc, ComputeDevice, LaunchShape, Rect};
use crate::error::{ConvolveError, DeviceFault, Result};
use crate::gpu::device::GpuDevice;
use crate::program::{ArgKind, KernelArgs, KernelProgram, KernelVariant};

const F32: u64 = std::mem::size_of::<f32>() as u64;

/// A device-resident f32 buffer.
#[derive(Debug)]
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    label: &'static str,
    len: usize,
}

impl GpuBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// A compiled compute pipeline for one kernel variant and workgroup shape.
#[derive(Debug)]
pub struct GpuKernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    variant: KernelVariant,
    workgroup: (u32, u32),
}

impl GpuDevice {
    /// Block until all submitted work has completed.
    fn finish(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn scoped<T>(&self, filter: wgpu::ErrorFilter, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = f();
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn transfer_scope(&self, buffer: &GpuBuffer, f: impl FnOnce()) -> Result<()> {
        let ((), error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            f();
            self.finish();
        });
        match error {
            None => Ok(()),
            Some(e) => Err(transfer_failure(buffer, e.to_string())),
        }
    }

    /// Copy `(offset, len)` element runs of `src` into a fresh staging
    /// buffer, back to back, and return the mapped contents.
    fn read_runs(&self, src: &GpuBuffer, runs: &[(usize, usize)]) -> Result<Vec<f32>> {
        let total: u64 = runs.iter().map(|&(_, n)| n as u64 * F32).sum();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (staging, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("readback staging"),
                size: total,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
            let mut dst = 0;
            for &(offset, n) in runs {
                let size = n as u64 * F32;
                encoder.copy_buffer_to_buffer(&src.buffer, offset as u64 * F32, &staging, dst, size);
                dst += size;
            }
            self.queue.submit(std::iter::once(encoder.finish()));
            staging
        });
        if let Some(e) = error {
            return Err(transfer_failure(src, e.to_string()));
        }

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.finish();
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(transfer_failure(src, e.to_string())),
            Err(_) => return Err(transfer_failure(src, "map callback never fired".into())),
        }

        let mapped = slice.get_mapped_range();
        let values = bytemuck::try_cast_slice::<u8, f32>(&mapped)
            .map(<[f32]>::to_vec)
            .map_err(|e| transfer_failure(src, format!("mapped range: {e}")));
        drop(mapped);
        staging.unmap();
        values
    }
}

fn transfer_failure(buffer: &GpuBuffer, message: String) -> ConvolveError {
    ConvolveError::TransferFailure { label: buffer.label.to_string(), source: DeviceFault::message(message) }
}

fn dispatch_failure(message: impl Into<String>) -> ConvolveError {
    ConvolveError::DispatchFailure { source: DeviceFault::message(message) }
}

fn check_rect(buffer: &GpuBuffer, rect: &Rect, host_len: usize) -> Result<()> {
    if rect.region.0 > rect.buffer_pitch
        || rect.region.0 > rect.host_pitch
        || rect.buffer_extent() > buffer.len
        || rect.host_extent() > host_len
    {
        return Err(transfer_failure(buffer, format!("rect {rect:?} out of range")));
    }
    Ok(())
}

impl ComputeDevice for GpuDevice {
    type Buffer = GpuBuffer;
    type Kernel = GpuKernel;

    fn name(&self) -> String {
        self.adapter_info.to_string()
    }

    fn limits(&self) -> DeviceLimits {
        self.device_limits()
    }

    fn allocate(&self, desc: &BufferDesc) -> Result<GpuBuffer> {
        let bytes = desc.bytes();
        let alloc_failure = |message: String| ConvolveError::AllocationFailure {
            label: desc.label.to_string(),
            bytes,
            source: DeviceFault::message(message),
        };
        let max = self.device_limits().max_buffer_bytes;
        if bytes > max {
            return Err(alloc_failure(format!("buffer exceeds the {max} byte limit")));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: bytes.max(F32),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        if let Some(e) = oom.or(validation) {
            return Err(alloc_failure(e.to_string()));
        }
        debug!("allocate `{}`: {} bytes", desc.label, bytes);
        Ok(GpuBuffer { buffer, label: desc.label, len: desc.len })
    }

    fn write(&self, buffer: &GpuBuffer, data: &[f32]) -> Result<()> {
        if data.len() > buffer.len {
            return Err(transfer_failure(
                buffer,
                format!("write of {} elements into a buffer of {}", data.len(), buffer.len),
            ));
        }
        self.transfer_scope(buffer, || {
            self.queue.write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
            self.queue.submit(std::iter::empty());
        })
    }

    fn write_rect(&self, buffer: &GpuBuffer, rect: &Rect, data: &[f32]) -> Result<()> {
        check_rect(buffer, rect, data.len())?;
        self.transfer_scope(buffer, || {
            for y in 0..rect.region.1 {
                let s = rect.host_offset(y);
                let row = &data[s..s + rect.region.0];
                let offset = rect.buffer_offset(y) as u64 * F32;
                self.queue.write_buffer(&buffer.buffer, offset, bytemuck::cast_slice(row));
            }
            self.queue.submit(std::iter::empty());
        })
    }

    fn read(&self, buffer: &GpuBuffer, out: &mut [f32]) -> Result<()> {
        if out.len() > buffer.len {
            return Err(transfer_failure(
                buffer,
                format!("read of {} elements from a buffer of {}", out.len(), buffer.len),
            ));
        }
        let values = self.read_runs(buffer, &[(0, out.len())])?;
        out.copy_from_slice(&values);
        Ok(())
    }

    fn read_rect(&self, buffer: &GpuBuffer, rect: &Rect, out: &mut [f32]) -> Result<()> {
        check_rect(buffer, rect, out.len())?;
        let runs: Vec<(usize, usize)> =
            (0..rect.region.1).map(|y| (rect.buffer_offset(y), rect.region.0)).collect();
        let values = self.read_runs(buffer, &runs)?;
        for (y, row) in values.chunks_exact(rect.region.0.max(1)).enumerate() {
            let d = rect.host_offset(y);
            out[d..d + row.len()].copy_from_slice(row);
        }
        Ok(())
    }

    fn build(&self, program: &KernelProgram) -> Result<GpuKernel> {
        let variant = program.variant();
        let build_failure =
            |log: String| ConvolveError::BuildFailure { program: variant.entry_point().to_string(), log };

        let (built, error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(variant.entry_point()),
                source: wgpu::ShaderSource::Wgsl(program.source().into()),
            });
            let info = pollster::block_on(module.get_compilation_info());

            let mut entries: Vec<wgpu::BindGroupLayoutEntry> = variant
                .arg_layout()
                .iter()
                .filter_map(|arg| match arg.kind() {
                    ArgKind::Buffer { writable } => Some(writable),
                    _ => None,
                })
                .enumerate()
                .map(|(binding, writable)| wgpu::BindGroupLayoutEntry {
                    binding: binding as u32,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: !writable },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: entries.len() as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });

            let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("convolution BGL"),
                entries: &entries,
            });
            let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("convolution pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(variant.entry_point()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: variant.entry_point(),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            (pipeline, layout, info)
        });

        let (pipeline, layout, info) = built;
        let mut log = String::new();
        for m in &info.messages {
            match m.message_type {
                wgpu::CompilationMessageType::Error => {
                    log.push_str(&m.message);
                    log.push('\n');
                }
                wgpu::CompilationMessageType::Warning => warn!("{}: {}", variant, m.message),
                wgpu::CompilationMessageType::Info => debug!("{}: {}", variant, m.message),
            }
        }
        if let Some(e) = error {
            log.push_str(&e.to_string());
        }
        if !log.is_empty() {
            return Err(build_failure(log));
        }

        debug!("built pipeline `{}` for workgroup {:?}", variant, program.workgroup());
        Ok(GpuKernel { pipeline, layout, variant, workgroup: program.workgroup() })
    }

    fn dispatch(
        &self,
        kernel: &GpuKernel,
        args: &KernelArgs<'_, GpuBuffer>,
        launch: &LaunchShape,
    ) -> Result<()> {
        if args.variant() != kernel.variant {
            return Err(dispatch_failure(format!(
                "arguments bound for `{}` but kernel is `{}`",
                args.variant(),
                kernel.variant
            )));
        }
        if launch.local != kernel.workgroup {
            return Err(dispatch_failure(format!(
                "launch local size {:?} differs from the pipeline's workgroup {:?}",
                launch.local, kernel.workgroup
            )));
        }

        let ((), error) = self.scoped(wgpu::ErrorFilter::Validation, || {
            let params = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("convolution params"),
                contents: bytemuck::cast_slice(&args.uniform_words()),
                usage: wgpu::BufferUsages::UNIFORM,
            });

            let mut entries: Vec<wgpu::BindGroupEntry> = args
                .buffer_bindings()
                .map(|(binding, _, buf)| wgpu::BindGroupEntry {
                    binding,
                    resource: buf.buffer.as_entire_binding(),
                })
                .collect();
            entries.push(wgpu::BindGroupEntry {
                binding: entries.len() as u32,
                resource: params.as_entire_binding(),
            });
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("convolution bind group"),
                layout: &kernel.layout,
                entries: &entries,
            });

            let (groups_x, groups_y) = launch.groups();
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("convolution") });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(kernel.variant.entry_point()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&kernel.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
            self.finish();
        });

        match error {
            None => Ok(()),
            Some(e) => Err(dispatch_failure(e.to_string())),
        }
    }
}
