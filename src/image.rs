// image.rs — Single-channel f32 image plane.
//
// The convolution core works on one layout only: a flat, row-major plane of
// IEEE-754 single-precision values, `width * height` elements, no stride
// padding. Device-side row padding (see transfer.rs) is a property of the
// device buffers, never of this host type.
//
// Coordinates follow the usual image convention: `x` is the column, `y` is
// the row. Pixel (x, y) lives at index `y * width + x`.
//
// INTERIOR vs BORDER:
// For a filter of radius r, the convolution writes only pixels with
// x in [r, width - r) and y in [r, height - r). Everything outside that
// rectangle is the border; its contents are whatever the caller pre-filled.
//
//   width = 8, r = 2:
//     row 0: B B B B B B B B
//     row 1: B B B B B B B B
//     row 2: B B I I I I B B
//     ...
//
// `interior()` yields exactly the written set, `border()` its complement.

use crate::error::{ConvolveError, Result};

/// A single-channel f32 image, row-major, stride == width.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl Image {
    // --- Constructors ---

    /// Create a zero-filled image.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, 0.0)
    }

    /// Create an image with every pixel set to `value`.
    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Image { data: vec![value; width * height], width, height }
    }

    /// Wrap an existing row-major pixel vector.
    ///
    /// # Errors
    /// `ImageSize` if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            return Err(ConvolveError::ImageSize { width, height, len: data.len() });
        }
        Ok(Image { data, width, height })
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Image { data, width, height }
    }

    // --- Accessors ---

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`.
    #[inline]
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Get the pixel at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.bounds_check(x, y);
        self.data[y * self.width + x]
    }

    /// Set the pixel at (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.bounds_check(x, y);
        self.data[y * self.width + x] = value;
    }

    /// Borrow row `y`.
    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    /// Mutable borrow of row `y`.
    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [f32] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.width;
        &mut self.data[start..start + self.width]
    }

    /// The whole plane, row-major.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the image and return its pixel vector.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    // --- Iteration ---

    /// Iterate all pixels as `(x, y, value)` in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        let w = self.width;
        self.data.iter().enumerate().map(move |(i, &v)| (i % w, i / w, v))
    }

    /// Iterate the interior left by a filter of the given radius.
    ///
    /// Empty when the image is too small to have an interior.
    pub fn interior(&self, radius: usize) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.pixels().filter(move |&(x, y, _)| self.is_interior(x, y, radius))
    }

    /// Iterate the border left by a filter of the given radius.
    pub fn border(&self, radius: usize) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.pixels().filter(move |&(x, y, _)| !self.is_interior(x, y, radius))
    }

    /// True if (x, y) is written by a convolution of the given radius.
    #[inline]
    pub fn is_interior(&self, x: usize, y: usize, radius: usize) -> bool {
        x >= radius && y >= radius && x + radius < self.width && y + radius < self.height
    }

    // --- Internal ---

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x}, {y}) out of bounds for {}x{} image",
            self.width,
            self.height,
        );
    }
}
