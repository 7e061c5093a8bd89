// transfer.rs — Device buffer manager: three interchangeable upload strategies.
//
// A strategy decides how the image plane is laid out on the device and how
// the result comes back:
//
//   Naive       device rows = image width. Input and output are each one
//               contiguous copy. The output buffer is seeded with the
//               pre-filled host plane, so a contiguous readback leaves the
//               border untouched.
//   Aligned     device rows padded to the workgroup width. The input goes
//               up as a rectangle of image-width rows; the row tails stay
//               unwritten. The output is left uninitialised and only the
//               interior rectangle is read back.
//   Vectorized  Aligned layout; the kernel loads its tile 4 wide.
//
// The strategy is chosen once, from `AccessStrategy`, and is used for both
// directions of a pass (`upload` and, via the collector, `download`).

use log::debug;

use crate::device::{BufferAccess, BufferDesc, ComputeDevice, DeviceBuffers, Rect};
use crate::error::{ConvolveError, Result};
use crate::filter::Filter;
use crate::geometry::{AccessStrategy, Geometry};
use crate::image::Image;

/// Moves one pass's image and filter onto a device and the result back.
pub trait BufferTransfer<D: ComputeDevice> {
    fn strategy(&self) -> AccessStrategy;

    /// Allocate and fill the input, output and filter buffers.
    ///
    /// `prefill` is the host output plane as it stands before collection.
    /// Strategies that read the output back contiguously upload it so the
    /// border survives the round trip; others ignore it.
    fn upload(
        &self,
        device: &D,
        image: &Image,
        filter: &Filter,
        prefill: &Image,
        geometry: &Geometry,
    ) -> Result<DeviceBuffers<D::Buffer>>;

    /// Copy the result into `output`, which must already hold the border.
    fn download(
        &self,
        device: &D,
        buffers: &DeviceBuffers<D::Buffer>,
        geometry: &Geometry,
        output: &mut Image,
    ) -> Result<()>;
}

/// The transfer implementation for `strategy`.
pub fn transfer_for<D: ComputeDevice>(strategy: AccessStrategy) -> Box<dyn BufferTransfer<D>> {
    match strategy {
        AccessStrategy::Naive => Box::new(NaiveTransfer),
        AccessStrategy::Aligned => Box::new(AlignedTransfer),
        AccessStrategy::Vectorized => Box::new(VectorizedTransfer),
    }
}

/// Upload `image` and `filter` with the strategy the geometry was planned for.
///
/// # Errors
/// - `DimensionsMismatch` if `image` or `prefill` do not match the geometry.
/// - `AllocationFailure` / `TransferFailure` from the device.
pub fn upload<D: ComputeDevice>(
    device: &D,
    image: &Image,
    filter: &Filter,
    prefill: &Image,
    geometry: &Geometry,
) -> Result<DeviceBuffers<D::Buffer>> {
    transfer_for::<D>(geometry.strategy).upload(device, image, filter, prefill, geometry)
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Contiguous copies, device rows as wide as the image.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveTransfer;

/// Rectangle copies into device rows padded to the workgroup width.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignedTransfer;

/// Aligned layout, read 4 wide by the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct VectorizedTransfer;

impl<D: ComputeDevice> BufferTransfer<D> for NaiveTransfer {
    fn strategy(&self) -> AccessStrategy {
        AccessStrategy::Naive
    }

    fn upload(
        &self,
        device: &D,
        image: &Image,
        filter: &Filter,
        prefill: &Image,
        geometry: &Geometry,
    ) -> Result<DeviceBuffers<D::Buffer>> {
        check_shapes(image, prefill, geometry)?;
        let buffers = allocate(device, geometry)?;
        device.write(&buffers.input, image.as_slice())?;
        device.write(&buffers.output, prefill.as_slice())?;
        device.write(&buffers.filter, filter.as_slice())?;
        debug!("naive upload: {} + {} elements", geometry.device_len(), geometry.filter_len());
        Ok(buffers)
    }

    fn download(
        &self,
        device: &D,
        buffers: &DeviceBuffers<D::Buffer>,
        geometry: &Geometry,
        output: &mut Image,
    ) -> Result<()> {
        check_output(output, geometry)?;
        device.read(&buffers.output, output.as_mut_slice())
    }
}

impl<D: ComputeDevice> BufferTransfer<D> for AlignedTransfer {
    fn strategy(&self) -> AccessStrategy {
        AccessStrategy::Aligned
    }

    fn upload(
        &self,
        device: &D,
        image: &Image,
        filter: &Filter,
        prefill: &Image,
        geometry: &Geometry,
    ) -> Result<DeviceBuffers<D::Buffer>> {
        upload_pitched(device, image, filter, prefill, geometry)
    }

    fn download(
        &self,
        device: &D,
        buffers: &DeviceBuffers<D::Buffer>,
        geometry: &Geometry,
        output: &mut Image,
    ) -> Result<()> {
        download_interior(device, buffers, geometry, output)
    }
}

impl<D: ComputeDevice> BufferTransfer<D> for VectorizedTransfer {
    fn strategy(&self) -> AccessStrategy {
        AccessStrategy::Vectorized
    }

    fn upload(
        &self,
        device: &D,
        image: &Image,
        filter: &Filter,
        prefill: &Image,
        geometry: &Geometry,
    ) -> Result<DeviceBuffers<D::Buffer>> {
        upload_pitched(device, image, filter, prefill, geometry)
    }

    fn download(
        &self,
        device: &D,
        buffers: &DeviceBuffers<D::Buffer>,
        geometry: &Geometry,
        output: &mut Image,
    ) -> Result<()> {
        download_interior(device, buffers, geometry, output)
    }
}

// ---------------------------------------------------------------------------
// Shared steps
// ---------------------------------------------------------------------------

fn allocate<D: ComputeDevice>(device: &D, geometry: &Geometry) -> Result<DeviceBuffers<D::Buffer>> {
    let image_len = geometry.device_len();
    Ok(DeviceBuffers {
        input: device.allocate(&BufferDesc {
            label: "image_in",
            len: image_len,
            access: BufferAccess::ReadOnly,
        })?,
        output: device.allocate(&BufferDesc {
            label: "image_out",
            len: image_len,
            access: BufferAccess::ReadWrite,
        })?,
        filter: device.allocate(&BufferDesc {
            label: "coeffs",
            len: geometry.filter_len(),
            access: BufferAccess::ReadOnly,
        })?,
    })
}

fn upload_pitched<D: ComputeDevice>(
    device: &D,
    image: &Image,
    filter: &Filter,
    prefill: &Image,
    geometry: &Geometry,
) -> Result<DeviceBuffers<D::Buffer>> {
    check_shapes(image, prefill, geometry)?;
    let buffers = allocate(device, geometry)?;
    let width = image.width();
    let rect = Rect {
        buffer_origin: (0, 0),
        host_origin: (0, 0),
        region: (width, image.height()),
        buffer_pitch: geometry.device_pitch as usize,
        host_pitch: width,
    };
    device.write_rect(&buffers.input, &rect, image.as_slice())?;
    device.write(&buffers.filter, filter.as_slice())?;
    debug!(
        "{} upload: {}x{} rows into pitch {}",
        geometry.strategy,
        width,
        image.height(),
        geometry.device_pitch
    );
    Ok(buffers)
}

/// The output rectangle the kernel writes: `[radius, dim - radius)` in both axes.
pub fn interior_rect(geometry: &Geometry) -> Rect {
    let r = geometry.radius as usize;
    Rect {
        buffer_origin: (r, r),
        host_origin: (r, r),
        region: (geometry.valid_width as usize, geometry.valid_height as usize),
        buffer_pitch: geometry.device_pitch as usize,
        host_pitch: geometry.image_width as usize,
    }
}

fn download_interior<D: ComputeDevice>(
    device: &D,
    buffers: &DeviceBuffers<D::Buffer>,
    geometry: &Geometry,
    output: &mut Image,
) -> Result<()> {
    check_output(output, geometry)?;
    device.read_rect(&buffers.output, &interior_rect(geometry), output.as_mut_slice())
}

fn planned_dims(geometry: &Geometry) -> (usize, usize) {
    (geometry.image_width as usize, geometry.image_height as usize)
}

fn check_shapes(image: &Image, prefill: &Image, geometry: &Geometry) -> Result<()> {
    let expected = planned_dims(geometry);
    for actual in [image.dimensions(), prefill.dimensions()] {
        if actual != expected {
            return Err(ConvolveError::DimensionsMismatch { expected, actual });
        }
    }
    Ok(())
}

fn check_output(output: &Image, geometry: &Geometry) -> Result<()> {
    let expected = planned_dims(geometry);
    if output.dimensions() != expected {
        return Err(ConvolveError::DimensionsMismatch { expected, actual: output.dimensions() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::WorkgroupShape;
    use crate::host::HostDevice;

    fn ramp(w: usize, h: usize) -> Image {
        Image::from_fn(w, h, |x, y| (y * w + x) as f32)
    }

    #[test]
    fn test_transfer_for_matches_strategy() {
        for s in AccessStrategy::ALL {
            assert_eq!(transfer_for::<HostDevice>(s).strategy(), s);
        }
    }

    #[test]
    fn test_naive_upload_is_contiguous_and_seeds_output() {
        let dev = HostDevice::default();
        let img = ramp(10, 8);
        let prefill = Image::filled(10, 8, 255.0);
        let g = Geometry::plan(10, 8, 3, WorkgroupShape::new(4, 4), AccessStrategy::Naive).unwrap();
        let bufs = upload(&dev, &img, &Filter::identity(3).unwrap(), &prefill, &g).unwrap();

        assert_eq!(bufs.input.snapshot(), img.as_slice());
        assert!(bufs.output.snapshot().iter().all(|&v| v == 255.0));
        assert_eq!(bufs.filter.len(), 9);
    }

    #[test]
    fn test_aligned_upload_pads_rows() {
        let dev = HostDevice::default();
        let img = ramp(10, 8);
        let g = Geometry::plan(10, 8, 3, WorkgroupShape::new(4, 4), AccessStrategy::Aligned).unwrap();
        assert_eq!(g.device_pitch, 12);
        let bufs = upload(&dev, &img, &Filter::identity(3).unwrap(), &img, &g).unwrap();

        let input = bufs.input.snapshot();
        assert_eq!(input.len(), 12 * 8);
        for y in 0..8 {
            assert_eq!(&input[y * 12..y * 12 + 10], img.row(y));
            assert!(input[y * 12 + 10].is_nan() && input[y * 12 + 11].is_nan());
        }
        // Output left uninitialised.
        assert!(bufs.output.snapshot().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_interior_download_keeps_border() {
        let dev = HostDevice::default();
        let img = ramp(10, 8);
        let g = Geometry::plan(10, 8, 3, WorkgroupShape::new(4, 4), AccessStrategy::Vectorized).unwrap();
        let bufs = upload(&dev, &img, &Filter::identity(3).unwrap(), &img, &g).unwrap();
        dev.write(&bufs.output, &vec![-1.0; g.device_len()]).unwrap();

        let mut out = Image::filled(10, 8, 7.0);
        transfer_for::<HostDevice>(g.strategy).download(&dev, &bufs, &g, &mut out).unwrap();
        for (x, y, v) in out.pixels() {
            if out.is_interior(x, y, 1) {
                assert_eq!(v, -1.0, "({x}, {y})");
            } else {
                assert_eq!(v, 7.0, "({x}, {y})");
            }
        }
    }

    #[test]
    fn test_shape_mismatch_rejected_before_allocation() {
        let dev = HostDevice::default();
        let g = Geometry::plan(10, 8, 3, WorkgroupShape::new(4, 4), AccessStrategy::Naive).unwrap();
        let err = upload(&dev, &ramp(8, 8), &Filter::identity(3).unwrap(), &ramp(8, 8), &g).unwrap_err();
        assert!(matches!(err, ConvolveError::DimensionsMismatch { expected: (10, 8), actual: (8, 8) }));
        assert_eq!(dev.memory_in_use(), 0);
    }
}
