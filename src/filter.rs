// filter.rs — Square convolution filter with an odd width.
//
// A filter is `width * width` coefficients, row-major. The width is always
// odd so the window has a centre pixel: radius = (width - 1) / 2, and the
// halo the tiled kernel must cache around each workgroup is
// `padding = 2 * radius` pixels per axis.
//
// Construction validates shape up front; every downstream stage can assume
// an odd width and a matching coefficient count.

use crate::convolution::gaussian_kernel_1d;
use crate::error::{ConvolveError, Result};

/// 45° motion blur, 7×7. The coefficients sum to 1.0003, not exactly 1.
#[rustfmt::skip]
const MOTION_BLUR_45: [f32; 49] = [
    0.0,    0.0,    0.0,    0.0,    0.0,    0.0145, 0.0,
    0.0,    0.0,    0.0,    0.0,    0.0376, 0.1283, 0.0145,
    0.0,    0.0,    0.0,    0.0376, 0.1283, 0.0376, 0.0,
    0.0,    0.0,    0.0376, 0.1283, 0.0376, 0.0,    0.0,
    0.0,    0.0376, 0.1283, 0.0376, 0.0,    0.0,    0.0,
    0.0145, 0.1283, 0.0376, 0.0,    0.0,    0.0,    0.0,
    0.0,    0.0145, 0.0,    0.0,    0.0,    0.0,    0.0,
];

/// An odd-width square filter, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    coeffs: Vec<f32>,
    width: usize,
}

impl Filter {
    /// Wrap row-major coefficients.
    ///
    /// # Errors
    /// - `InvalidFilter` if `width` is zero or even.
    /// - `FilterLength` if `coeffs.len() != width * width`.
    pub fn new(width: usize, coeffs: Vec<f32>) -> Result<Self> {
        validate_width(width)?;
        if coeffs.len() != width * width {
            return Err(ConvolveError::FilterLength { width, len: coeffs.len() });
        }
        Ok(Filter { coeffs, width })
    }

    /// 1 at the centre, 0 elsewhere.
    pub fn identity(width: usize) -> Result<Self> {
        validate_width(width)?;
        let mut coeffs = vec![0.0; width * width];
        coeffs[width * width / 2] = 1.0;
        Ok(Filter { coeffs, width })
    }

    /// Uniform average over the window.
    pub fn box_blur(width: usize) -> Result<Self> {
        validate_width(width)?;
        let n = (width * width) as f32;
        Ok(Filter { coeffs: vec![1.0 / n; width * width], width })
    }

    /// Separable Gaussian expanded to 2D: k2[i][j] = k[i] * k[j].
    ///
    /// Width is `2 * radius + 1`; the coefficients sum to 1 up to rounding.
    ///
    /// # Errors
    /// `InvalidSigma` unless `sigma` is positive (NaN included).
    pub fn gaussian(radius: usize, sigma: f32) -> Result<Self> {
        if !(sigma > 0.0) {
            return Err(ConvolveError::InvalidSigma { sigma });
        }
        let k = gaussian_kernel_1d(radius, sigma);
        let width = k.len();
        let coeffs = k.iter().flat_map(|&a| k.iter().map(move |&b| a * b)).collect();
        Ok(Filter { coeffs, width })
    }

    /// Laplacian edge detector. The coefficients sum to exactly 0, so a flat
    /// field convolves to 0.
    ///
    /// - 3: `0 1 0 / 1 -4 1 / 0 1 0`
    /// - 5: every tap -1, centre 24
    /// - 7: every tap -1, centre 48
    ///
    /// # Errors
    /// `InvalidFilter` for any other width.
    pub fn edge_detect(width: usize) -> Result<Self> {
        let coeffs = match width {
            3 => vec![0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0],
            5 | 7 => {
                let mut c = vec![-1.0; width * width];
                c[width * width / 2] = (width * width - 1) as f32;
                c
            }
            _ => return Err(ConvolveError::InvalidFilter { width }),
        };
        Ok(Filter { coeffs, width })
    }

    /// The 7×7 45° motion blur.
    pub fn motion_blur_45() -> Self {
        Filter { coeffs: MOTION_BLUR_45.to_vec(), width: 7 }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// `(width - 1) / 2`.
    #[inline]
    pub fn radius(&self) -> usize {
        self.width / 2
    }

    /// Halo pixels per axis: `2 * radius`.
    #[inline]
    pub fn padding(&self) -> usize {
        self.radius() * 2
    }

    /// Coefficient at filter row `row`, column `col`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        assert!(row < self.width && col < self.width, "filter index ({row}, {col}) out of bounds");
        self.coeffs[row * self.width + col]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.coeffs
    }

    /// Sum of all coefficients, in row-major order.
    pub fn sum(&self) -> f32 {
        self.coeffs.iter().sum()
    }
}

fn validate_width(width: usize) -> Result<()> {
    if width == 0 || width % 2 == 0 {
        return Err(ConvolveError::InvalidFilter { width });
    }
    Ok(())
}
