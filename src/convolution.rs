// convolution.rs — Direct 2D convolution on the host (golden reference).
//
// This is the untiled formulation of the same arithmetic the tiled kernel
// performs: for every interior pixel, sum the filterWidth × filterWidth
// window whose top-left corner sits `radius` pixels up and left of the
// pixel, multiplying by the filter in row-major coefficient order.
//
// SUMMATION ORDER:
// The accumulator starts at 0.0 and adds terms in exactly the order the
// kernel does (filter row by filter row, left to right). f32 addition is
// not associative, so this is what makes host-device results comparable
// bit-for-bit on the host device (kernel.rs) rather than within a tolerance.
//
// BORDER HANDLING: none. Output pixels closer than `radius` to an edge are
// not computed; they keep whatever the caller put in `output`. This matches
// the device kernel, which never writes the border.

use crate::error::{ConvolveError, Result};
use crate::filter::Filter;
use crate::image::Image;

/// Convolve `src` with `filter`, writing only interior pixels of `output`.
///
/// # Errors
/// - `DimensionsMismatch` if `output` differs in shape from `src`.
/// - `ImageTooSmall` if the image has no interior for this filter.
pub fn convolve_direct_into(src: &Image, filter: &Filter, output: &mut Image) -> Result<()> {
    if output.dimensions() != src.dimensions() {
        return Err(ConvolveError::DimensionsMismatch {
            expected: src.dimensions(),
            actual: output.dimensions(),
        });
    }

    let (w, h) = src.dimensions();
    let fw = filter.width();
    let padding = filter.padding();
    if w <= padding || h <= padding {
        return Err(ConvolveError::ImageTooSmall { width: w, height: h, padding });
    }

    let radius = filter.radius();
    let pixels = src.as_slice();
    let coeffs = filter.as_slice();

    // (row, col) is the window's top-left corner, i.e. the anchor the kernel
    // uses; the result lands at the window centre.
    for row in 0..(h - padding) {
        for col in 0..(w - padding) {
            let mut sum = 0.0f32;
            let mut k = 0;
            for i in row..row + fw {
                let offset = i * w;
                for j in col..col + fw {
                    sum += pixels[offset + j] * coeffs[k];
                    k += 1;
                }
            }
            output.set(col + radius, row + radius, sum);
        }
    }
    Ok(())
}

/// Convolve `src` with `filter`, leaving the border equal to `src`.
pub fn convolve_direct(src: &Image, filter: &Filter) -> Result<Image> {
    let mut out = src.clone();
    convolve_direct_into(src, filter, &mut out)?;
    Ok(out)
}

/// Generate a 1D Gaussian kernel with the given half-size and sigma.
///
/// Returns a kernel of length `2 * half_size + 1`, normalized so the
/// coefficients sum to 1.0.
///
/// # Examples
/// ```
/// let k = tiled_conv::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    assert!(sigma > 0.0, "sigma must be positive");
    let len = 2 * half_size + 1;
    let two_sigma_sq = 2.0 * sigma * sigma;

    let mut kernel: Vec<f32> = (0..len)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}
