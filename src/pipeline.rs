// pipeline.rs — One convolution pass, end to end.
//
// Stages run strictly in order and never re-enter an earlier one:
//
//   plan      Geometry::plan + check against the device limits
//   upload    transfer strategy allocates and fills the buffers (blocking)
//   build     instantiate the kernel program for this geometry and compile
//   dispatch  bind the variant's argument table, launch, wait
//   collect   read back into the pre-filled host plane
//
// Configuration errors surface from the plan stage, before the device is
// touched. Device buffers live for this call only and are released on every
// exit path when `DeviceBuffers` drops. A device that never completes the
// dispatch blocks `run` indefinitely; there is no timeout.

use std::time::Instant;

use log::{debug, info};

use crate::collector::{collect, prefill};
use crate::config::ConvolveConfig;
use crate::device::{ComputeDevice, LaunchShape};
use crate::error::{ConvolveError, Result};
use crate::filter::Filter;
use crate::geometry::{AccessStrategy, Geometry, WorkgroupShape};
use crate::host::HostDevice;
use crate::image::Image;
use crate::program::{KernelArgs, KernelProgram, KernelVariant};
use crate::transfer::transfer_for;

/// Convolve on a default [`HostDevice`].
///
/// The result has the input's dimensions; interior pixels hold the
/// convolution and the border keeps the input pixels.
///
/// ```
/// use tiled_conv::{convolve, AccessStrategy, Filter, Image, WorkgroupShape};
///
/// let image = Image::filled(16, 16, 1.0);
/// let blur = Filter::motion_blur_45();
/// let out = convolve(&image, &blur, WorkgroupShape::new(16, 16), AccessStrategy::Naive).unwrap();
/// assert!((out.get(8, 8) - blur.sum()).abs() < 1e-4);
/// assert_eq!(out.get(0, 0), 1.0);
/// ```
pub fn convolve(
    image: &Image,
    filter: &Filter,
    workgroup: WorkgroupShape,
    strategy: AccessStrategy,
) -> Result<Image> {
    let config = ConvolveConfig { workgroup, strategy, ..ConvolveConfig::default() };
    Convolver::new(HostDevice::default(), config).run(image, filter)
}

/// Runs convolution passes on one device with one configuration.
#[derive(Debug)]
pub struct Convolver<D: ComputeDevice> {
    device: D,
    config: ConvolveConfig,
}

impl<D: ComputeDevice> Convolver<D> {
    pub fn new(device: D, config: ConvolveConfig) -> Self {
        Convolver { device, config }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &ConvolveConfig {
        &self.config
    }

    /// Plan a pass for `image` and `filter` and check it fits the device.
    ///
    /// An untiled pass never allocates the tile, so workgroup memory is not
    /// checked for it.
    pub fn plan(&self, image: &Image, filter: &Filter) -> Result<Geometry> {
        self.config.validate()?;
        let geometry = Geometry::plan(
            image.width(),
            image.height(),
            filter.width(),
            self.config.workgroup,
            self.config.strategy,
        )?;
        let mut limits = self.device.limits();
        if !self.variant(&geometry).uses_tile() {
            limits.max_shared_bytes = u32::MAX;
        }
        geometry.check_limits(&limits)?;
        Ok(geometry)
    }

    fn variant(&self, geometry: &Geometry) -> KernelVariant {
        KernelVariant::select(geometry.strategy, self.config.memory)
    }

    /// Convolve into a new image whose border follows `config.border`.
    pub fn run(&self, image: &Image, filter: &Filter) -> Result<Image> {
        let mut output = prefill(image, self.config.border);
        self.run_into(image, filter, &mut output)?;
        Ok(output)
    }

    /// Convolve into `output`, overwriting the interior only.
    ///
    /// `output` must have the input's dimensions; its border is left as is.
    ///
    /// # Errors
    /// Configuration errors (`InvalidFilter`, `ImageTooSmall`,
    /// `InvalidWorkgroup`, `WorkgroupTooLarge`, `SharedMemoryExceeded`,
    /// `DimensionsMismatch`) before any device call; then `AllocationFailure`,
    /// `TransferFailure`, `BuildFailure` or `DispatchFailure` from the device.
    pub fn run_into(&self, image: &Image, filter: &Filter, output: &mut Image) -> Result<()> {
        let start = Instant::now();

        let geometry = self.plan(image, filter)?;
        if output.dimensions() != image.dimensions() {
            return Err(ConvolveError::DimensionsMismatch {
                expected: image.dimensions(),
                actual: output.dimensions(),
            });
        }
        debug!("plan: {geometry}");

        let transfer = transfer_for::<D>(geometry.strategy);
        let buffers = transfer.upload(&self.device, image, filter, output, &geometry)?;

        let variant = self.variant(&geometry);
        let program = KernelProgram::instantiate(variant, &geometry);
        let kernel = self.device.build(&program)?;

        let args = KernelArgs::bind(variant, &buffers, &geometry);
        let launch = LaunchShape::from_geometry(&geometry);
        self.device.dispatch(&kernel, &args, &launch)?;
        debug!("dispatch complete after {:.2?}", start.elapsed());

        collect(&self.device, &buffers, &geometry, output)?;

        info!(
            "convolved {}x{} with {}x{} filter on {} ({} strategy, `{}`, workgroup {}) in {:.2?}",
            geometry.image_width,
            geometry.image_height,
            geometry.filter_width,
            geometry.filter_width,
            self.device.name(),
            geometry.strategy,
            variant,
            geometry.workgroup,
            start.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BorderFill, DeviceLimits, KernelMemory};

    #[test]
    fn test_identity_reproduces_image() {
        let img = Image::from_fn(20, 12, |x, y| (x * 3 + y * 7) as f32);
        let out = convolve(&img, &Filter::identity(3).unwrap(), WorkgroupShape::new(8, 4), AccessStrategy::Aligned)
            .unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_constant_border() {
        let img = Image::filled(12, 12, 1.0);
        let cfg = ConvolveConfig::default()
            .with_workgroup(4, 4)
            .with_border(BorderFill::Constant(255.0));
        let out = Convolver::new(HostDevice::default(), cfg)
            .run(&img, &Filter::box_blur(5).unwrap())
            .unwrap();
        for (_, _, v) in out.border(2) {
            assert_eq!(v, 255.0);
        }
        for (_, _, v) in out.interior(2) {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_limits_checked_before_allocation() {
        let limits = DeviceLimits { max_workgroup_invocations: 64, ..DeviceLimits::default() };
        let conv = Convolver::new(HostDevice::with_limits(limits), ConvolveConfig::default());
        let err = conv.run(&Image::new(32, 32), &Filter::identity(3).unwrap()).unwrap_err();
        assert!(matches!(err, ConvolveError::WorkgroupTooLarge { total: 256, max: 64 }));
        assert_eq!(conv.device().transfer_count(), 0);
    }

    #[test]
    fn test_untiled_pass_ignores_shared_memory_limit() {
        // 16 + 62 = 78; a 78x78 tile needs 24336 bytes, more than 16 KiB.
        let img = Image::filled(80, 80, 2.0);
        let blur = Filter::box_blur(63).unwrap();
        let tiled = Convolver::new(HostDevice::default(), ConvolveConfig::default());
        assert!(matches!(tiled.plan(&img, &blur), Err(ConvolveError::SharedMemoryExceeded { .. })));

        let global = Convolver::new(
            HostDevice::default(),
            ConvolveConfig::default().with_memory(KernelMemory::Global),
        );
        let out = global.run(&img, &blur).unwrap();
        assert!((out.get(40, 40) - 2.0).abs() < 1e-3);
        assert_eq!(global.device().last_dispatch().map(|d| d.written.len()), Some(18 * 18));
    }

    #[test]
    fn test_output_shape_checked() {
        let conv = Convolver::new(HostDevice::default(), ConvolveConfig::default());
        let mut out = Image::new(8, 8);
        let err = conv
            .run_into(&Image::new(10, 10), &Filter::identity(3).unwrap(), &mut out)
            .unwrap_err();
        assert!(matches!(err, ConvolveError::DimensionsMismatch { .. }));
    }

    #[test]
    fn test_buffers_released_after_run() {
        let conv = Convolver::new(HostDevice::default(), ConvolveConfig::default());
        conv.run(&Image::new(40, 40), &Filter::motion_blur_45()).unwrap();
        assert_eq!(conv.device().memory_in_use(), 0);
    }
}
