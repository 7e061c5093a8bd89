// collector.rs — Result collector: device output back into a host image.
//
// The kernel never writes the `radius`-wide border, so the host plane has to
// hold the border before collection starts. `prefill` builds that plane from
// a `BorderFill`; `collect` then copies the result in with the pass's own
// strategy (contiguous for naive, interior rectangle otherwise). Either way
// the border pixels end up exactly as pre-filled.

use log::debug;

use crate::config::BorderFill;
use crate::device::{ComputeDevice, DeviceBuffers};
use crate::error::Result;
use crate::geometry::Geometry;
use crate::image::Image;
use crate::transfer::transfer_for;

/// The host output plane before collection.
pub fn prefill(input: &Image, border: BorderFill) -> Image {
    match border {
        BorderFill::Source => input.clone(),
        BorderFill::Constant(v) => Image::filled(input.width(), input.height(), v),
    }
}

/// Read the output buffer into `output`.
///
/// Must run after the dispatch has completed; `ComputeDevice::dispatch`
/// returning is that synchronisation point.
///
/// # Errors
/// - `DimensionsMismatch` if `output` does not match the geometry.
/// - `TransferFailure` if the readback fails.
pub fn collect<D: ComputeDevice>(
    device: &D,
    buffers: &DeviceBuffers<D::Buffer>,
    geometry: &Geometry,
    output: &mut Image,
) -> Result<()> {
    transfer_for::<D>(geometry.strategy).download(device, buffers, geometry, output)?;
    debug!(
        "collected {}x{} interior ({} readback)",
        geometry.valid_width, geometry.valid_height, geometry.strategy
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefill_source_copies_input() {
        let img = Image::from_fn(4, 3, |x, y| (x + y) as f32);
        assert_eq!(prefill(&img, BorderFill::Source), img);
    }

    #[test]
    fn test_prefill_constant() {
        let img = Image::new(5, 2);
        let p = prefill(&img, BorderFill::Constant(255.0));
        assert_eq!(p.dimensions(), (5, 2));
        assert!(p.as_slice().iter().all(|&v| v == 255.0));
    }
}
