// geometry.rs — Layout planning for one tiled convolution pass.
//
// Everything the buffer manager, kernel and collector need to agree on is
// derived here, once, from (image size, filter width, workgroup shape,
// access strategy). The planner is pure: no device, no allocation.
//
// THE NUMBERS, for a 7×7 filter and 16×16 workgroups:
//
//   padding      = (7 / 2) * 2                   = 6
//   valid region = (W - 6) × (H - 6)             one work-item per output pixel
//   dispatch     = roundUp(W - 6, 16) × roundUp(H - 6, 16)
//   tile         = (16 + 6) × (16 + 6)           = 22 × 22
//                  width rounded to 24 for 4-wide loads
//   shared bytes = tile width × tile height × 4
//
// Work-item (gx, gy) owns output pixel (gx + r, gy + r) and anchors its
// window at tile cell (lx, ly). Work-items past the valid region exist only
// because the dispatch is rounded up; they load their share of the tile and
// skip the write.
//
// DEVICE PITCH:
// Naive keeps device rows as wide as the image. Aligned pads every device
// row to a multiple of the workgroup width, so each workgroup row starts at
// an aligned element. Vectorized pads to a multiple of lcm(workgroup width,
// 4): device rows start on a 16-byte boundary even when the workgroup width
// is not a multiple of 4, and the kernel realigns its quad loads to the
// group origin.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DeviceLimits;
use crate::error::{ConvolveError, Result};

/// Bytes per image element on the device (f32).
pub const ELEMENT_SIZE: u32 = std::mem::size_of::<f32>() as u32;

/// Width of one vector load in the 4-wide strategy.
pub const VECTOR_WIDTH: u32 = 4;

/// Round `value` up to the nearest multiple of `multiple`.
///
/// Values that are already multiples are returned unchanged.
///
/// # Panics
/// Panics if `multiple` is zero.
#[inline]
pub fn round_up(value: u32, multiple: u32) -> u32 {
    assert!(multiple > 0, "round_up multiple must be positive");
    match value % multiple {
        0 => value,
        rem => value + (multiple - rem),
    }
}

// ---------------------------------------------------------------------------
// Workgroup shape and access strategy
// ---------------------------------------------------------------------------

/// Work-items per workgroup along x (columns) and y (rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkgroupShape {
    pub width: u32,
    pub height: u32,
}

impl WorkgroupShape {
    pub const fn new(width: u32, height: u32) -> Self {
        WorkgroupShape { width, height }
    }

    /// Total invocations per workgroup, saturating at `u32::MAX`.
    pub fn total(&self) -> u32 {
        self.width.saturating_mul(self.height)
    }
}

impl Default for WorkgroupShape {
    fn default() -> Self {
        WorkgroupShape { width: 16, height: 16 }
    }
}

impl fmt::Display for WorkgroupShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.width, self.height, self.total())
    }
}

/// How the image moves between host and device, and how the kernel reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStrategy {
    /// One contiguous copy; device rows are image-width.
    #[default]
    Naive,
    /// Row-rectangle copy into device rows padded to the workgroup width.
    Aligned,
    /// As `Aligned`, with the kernel loading its tile four samples at a time.
    Vectorized,
}

impl AccessStrategy {
    pub const ALL: [AccessStrategy; 3] =
        [AccessStrategy::Naive, AccessStrategy::Aligned, AccessStrategy::Vectorized];

    pub fn as_str(self) -> &'static str {
        match self {
            AccessStrategy::Naive => "naive",
            AccessStrategy::Aligned => "aligned",
            AccessStrategy::Vectorized => "vectorized",
        }
    }
}

impl fmt::Display for AccessStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "naive" => Ok(AccessStrategy::Naive),
            "aligned" | "read_aligned" => Ok(AccessStrategy::Aligned),
            "vectorized" | "read4" => Ok(AccessStrategy::Vectorized),
            other => Err(format!("unknown access strategy `{other}`")),
        }
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Derived layout of one convolution pass. Read-only once planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub image_width: u32,
    pub image_height: u32,
    pub filter_width: u32,
    /// `(filter_width - 1) / 2`.
    pub radius: u32,
    /// `2 * radius`.
    pub padding: u32,
    /// Output pixels per row that the kernel writes: `image_width - padding`.
    pub valid_width: u32,
    pub valid_height: u32,
    /// Total work-items along x: `valid_width` rounded up to the workgroup width.
    pub dispatch_width: u32,
    pub dispatch_height: u32,
    pub workgroup: WorkgroupShape,
    /// Tile width in elements (workgroup width + padding, rounded to 4 when vectorized).
    pub local_width: u32,
    /// Tile height in elements (workgroup height + padding, never rounded).
    pub local_height: u32,
    /// Workgroup memory needed for the tile.
    pub shared_bytes: u32,
    /// Device row width in elements.
    pub device_pitch: u32,
    pub strategy: AccessStrategy,
}

impl Geometry {
    /// Plan a pass.
    ///
    /// # Errors
    /// - `InvalidFilter` if `filter_width` is zero or even.
    /// - `InvalidWorkgroup` for a zero dimension.
    /// - `ImageTooSmall` if no pixel survives the padding.
    /// - `DimensionOverflow` if a derived size leaves the u32 range.
    pub fn plan(
        image_width: usize,
        image_height: usize,
        filter_width: usize,
        workgroup: WorkgroupShape,
        strategy: AccessStrategy,
    ) -> Result<Self> {
        if filter_width == 0 || filter_width % 2 == 0 {
            return Err(ConvolveError::InvalidFilter { width: filter_width });
        }
        if workgroup.width == 0 || workgroup.height == 0 {
            return Err(ConvolveError::InvalidWorkgroup {
                width: workgroup.width,
                height: workgroup.height,
                reason: "dimensions must be non-zero",
            });
        }

        let padding_px = (filter_width / 2) * 2;
        if image_width <= padding_px || image_height <= padding_px {
            return Err(ConvolveError::ImageTooSmall {
                width: image_width,
                height: image_height,
                padding: padding_px,
            });
        }

        let image_width = to_u32(image_width)?;
        let image_height = to_u32(image_height)?;
        let filter_width = to_u32(filter_width)?;
        let radius = filter_width / 2;
        let padding = radius * 2;

        let valid_width = image_width - padding;
        let valid_height = image_height - padding;
        let dispatch_width = checked_round_up(valid_width, workgroup.width)?;
        let dispatch_height = checked_round_up(valid_height, workgroup.height)?;

        let local_width = checked_add(workgroup.width, padding)?;
        let local_width = match strategy {
            AccessStrategy::Vectorized => checked_round_up(local_width, VECTOR_WIDTH)?,
            AccessStrategy::Naive | AccessStrategy::Aligned => local_width,
        };
        let local_height = checked_add(workgroup.height, padding)?;
        let shared_bytes = local_width
            .checked_mul(local_height)
            .and_then(|n| n.checked_mul(ELEMENT_SIZE))
            .ok_or(ConvolveError::DimensionOverflow((local_width as usize) * (local_height as usize)))?;

        let device_pitch = match strategy {
            AccessStrategy::Naive => image_width,
            AccessStrategy::Aligned => checked_round_up(image_width, workgroup.width)?,
            AccessStrategy::Vectorized => {
                let row_align = workgroup.width / gcd(workgroup.width, VECTOR_WIDTH);
                let row_align = row_align
                    .checked_mul(VECTOR_WIDTH)
                    .ok_or(ConvolveError::DimensionOverflow(row_align as usize * VECTOR_WIDTH as usize))?;
                checked_round_up(image_width, row_align)?
            }
        };

        Ok(Geometry {
            image_width,
            image_height,
            filter_width,
            radius,
            padding,
            valid_width,
            valid_height,
            dispatch_width,
            dispatch_height,
            workgroup,
            local_width,
            local_height,
            shared_bytes,
            device_pitch,
            strategy,
        })
    }

    /// Workgroups along x and y.
    pub fn workgroup_count(&self) -> (u32, u32) {
        (
            self.dispatch_width / self.workgroup.width,
            self.dispatch_height / self.workgroup.height,
        )
    }

    /// Tile cells (`local_width * local_height`).
    pub fn tile_len(&self) -> u32 {
        self.local_width * self.local_height
    }

    /// Elements in each image-sized device buffer (`device_pitch * image_height`).
    pub fn device_len(&self) -> usize {
        self.device_pitch as usize * self.image_height as usize
    }

    /// Elements in the filter buffer.
    pub fn filter_len(&self) -> usize {
        (self.filter_width * self.filter_width) as usize
    }

    /// Check the plan against what a device can run.
    ///
    /// # Errors
    /// - `WorkgroupTooLarge` if the invocation count or a dimension exceeds the limit.
    /// - `SharedMemoryExceeded` if the tile does not fit workgroup memory.
    /// - `AllocationFailure` is *not* raised here; buffer sizes are checked
    ///   by the device when it allocates.
    pub fn check_limits(&self, limits: &DeviceLimits) -> Result<()> {
        let total = self.workgroup.total();
        if total > limits.max_workgroup_invocations {
            return Err(ConvolveError::WorkgroupTooLarge {
                total,
                max: limits.max_workgroup_invocations,
            });
        }
        if self.workgroup.width > limits.max_workgroup_width
            || self.workgroup.height > limits.max_workgroup_height
        {
            return Err(ConvolveError::WorkgroupTooLarge {
                total,
                max: limits.max_workgroup_width.min(limits.max_workgroup_height),
            });
        }
        if self.shared_bytes > limits.max_shared_bytes {
            return Err(ConvolveError::SharedMemoryExceeded {
                needed: self.shared_bytes as u64,
                max: limits.max_shared_bytes as u64,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} image, {}x{} filter, {} strategy, dispatch {}x{} in {} groups, tile {}x{} ({} B), pitch {}",
            self.image_width,
            self.image_height,
            self.filter_width,
            self.filter_width,
            self.strategy,
            self.dispatch_width,
            self.dispatch_height,
            self.workgroup,
            self.local_width,
            self.local_height,
            self.shared_bytes,
            self.device_pitch,
        )
    }
}

fn to_u32(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| ConvolveError::DimensionOverflow(v))
}

fn checked_add(a: u32, b: u32) -> Result<u32> {
    a.checked_add(b)
        .ok_or(ConvolveError::DimensionOverflow(a as usize + b as usize))
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn checked_round_up(value: u32, multiple: u32) -> Result<u32> {
    let rem = value % multiple;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(multiple - rem)
        .ok_or(ConvolveError::DimensionOverflow(value as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WG16: WorkgroupShape = WorkgroupShape::new(16, 16);

    #[test]
    fn test_round_up_exact_multiple_unchanged() {
        assert_eq!(round_up(32, 16), 32);
        assert_eq!(round_up(0, 16), 0);
    }

    #[test]
    fn test_round_up_ceiling() {
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(17, 16), 32);
        assert_eq!(round_up(22, 4), 24);
    }

    #[test]
    fn test_plan_7x7_16x16_naive() {
        let g = Geometry::plan(640, 480, 7, WG16, AccessStrategy::Naive).unwrap();
        assert_eq!(g.padding, 6);
        assert_eq!(g.radius, 3);
        assert_eq!((g.local_width, g.local_height), (22, 22));
        assert_eq!(g.shared_bytes, 22 * 22 * 4);
        assert_eq!((g.valid_width, g.valid_height), (634, 474));
        assert_eq!((g.dispatch_width, g.dispatch_height), (640, 480));
        assert_eq!(g.workgroup_count(), (40, 30));
        assert_eq!(g.device_pitch, 640);
    }

    #[test]
    fn test_plan_vectorized_rounds_tile_width_only() {
        let g = Geometry::plan(640, 480, 7, WG16, AccessStrategy::Vectorized).unwrap();
        assert_eq!((g.local_width, g.local_height), (24, 22));
        assert_eq!(g.shared_bytes, 24 * 22 * 4);
    }

    #[test]
    fn test_plan_aligned_pads_device_rows() {
        let g = Geometry::plan(100, 50, 3, WG16, AccessStrategy::Aligned).unwrap();
        assert_eq!(g.device_pitch, 112);
        assert_eq!(g.device_len(), 112 * 50);
        assert_eq!((g.local_width, g.local_height), (18, 18));
        let naive = Geometry::plan(100, 50, 3, WG16, AccessStrategy::Naive).unwrap();
        assert_eq!(naive.device_pitch, 100);
    }

    #[test]
    fn test_plan_no_over_rounding() {
        // valid width 32 is already a multiple of 16.
        let g = Geometry::plan(38, 38, 7, WG16, AccessStrategy::Naive).unwrap();
        assert_eq!(g.valid_width, 32);
        assert_eq!(g.dispatch_width, 32);
    }

    #[test]
    fn test_plan_rejects_even_filter() {
        let err = Geometry::plan(64, 64, 4, WG16, AccessStrategy::Naive).unwrap_err();
        assert!(matches!(err, ConvolveError::InvalidFilter { width: 4 }));
        let err = Geometry::plan(64, 64, 0, WG16, AccessStrategy::Naive).unwrap_err();
        assert!(matches!(err, ConvolveError::InvalidFilter { width: 0 }));
    }

    #[test]
    fn test_plan_rejects_image_smaller_than_padding() {
        let err = Geometry::plan(6, 64, 7, WG16, AccessStrategy::Naive).unwrap_err();
        assert!(matches!(err, ConvolveError::ImageTooSmall { width: 6, padding: 6, .. }));
        // One valid pixel is enough.
        assert!(Geometry::plan(7, 7, 7, WG16, AccessStrategy::Naive).is_ok());
    }

    #[test]
    fn test_plan_rejects_bad_workgroups() {
        let err = Geometry::plan(64, 64, 3, WorkgroupShape::new(0, 8), AccessStrategy::Naive)
            .unwrap_err();
        assert!(matches!(err, ConvolveError::InvalidWorkgroup { width: 0, .. }));
        let err = Geometry::plan(64, 64, 3, WorkgroupShape::new(5, 0), AccessStrategy::Vectorized)
            .unwrap_err();
        assert!(matches!(err, ConvolveError::InvalidWorkgroup { height: 0, .. }));
    }

    #[test]
    fn test_plan_vectorized_unaligned_workgroup_width() {
        // lcm(6, 4) = 12, so rows stay 16-byte aligned.
        let g = Geometry::plan(64, 64, 7, WorkgroupShape::new(6, 8), AccessStrategy::Vectorized)
            .unwrap();
        assert_eq!(g.device_pitch, 72);
        assert_eq!((g.local_width, g.local_height), (12, 14));
        let g = Geometry::plan(30, 20, 3, WorkgroupShape::new(5, 3), AccessStrategy::Vectorized)
            .unwrap();
        assert_eq!(g.device_pitch, 40);
        assert_eq!(g.local_width, 8);
        let aligned = Geometry::plan(64, 64, 7, WorkgroupShape::new(6, 8), AccessStrategy::Aligned)
            .unwrap();
        assert_eq!(aligned.device_pitch, 66);
    }

    #[test]
    fn test_plan_huge_workgroup_overflows_instead_of_panicking() {
        for s in AccessStrategy::ALL {
            let err = Geometry::plan(16, 16, 3, WorkgroupShape::new(u32::MAX, 1), s).unwrap_err();
            assert!(matches!(err, ConvolveError::DimensionOverflow(_)), "{s}: {err}");
            let err = Geometry::plan(16, 16, 3, WorkgroupShape::new(1, u32::MAX - 1), s).unwrap_err();
            assert!(matches!(err, ConvolveError::DimensionOverflow(_)), "{s}: {err}");
        }
        assert_eq!(WorkgroupShape::new(65536, 65536).total(), u32::MAX);
    }

    #[test]
    fn test_check_limits_saturates_invocation_count() {
        let limits = DeviceLimits::default();
        let mut g = Geometry::plan(64, 64, 3, WG16, AccessStrategy::Naive).unwrap();
        g.workgroup = WorkgroupShape::new(65536, 65536);
        assert!(matches!(
            g.check_limits(&limits),
            Err(ConvolveError::WorkgroupTooLarge { total: u32::MAX, max: 256 })
        ));
    }

    #[test]
    fn test_check_limits() {
        let limits = DeviceLimits::default();
        let g = Geometry::plan(64, 64, 7, WG16, AccessStrategy::Naive).unwrap();
        assert!(g.check_limits(&limits).is_ok());

        let big = Geometry::plan(64, 64, 3, WorkgroupShape::new(32, 16), AccessStrategy::Naive)
            .unwrap();
        assert!(matches!(
            big.check_limits(&limits),
            Err(ConvolveError::WorkgroupTooLarge { total: 512, max: 256 })
        ));

        // 16 + 62 = 78; 78 * 78 * 4 = 24336 > 16384.
        let wide = Geometry::plan(256, 256, 63, WG16, AccessStrategy::Naive).unwrap();
        assert!(matches!(
            wide.check_limits(&limits),
            Err(ConvolveError::SharedMemoryExceeded { needed: 24336, max: 16384 })
        ));
    }

    #[test]
    fn test_strategy_parse_roundtrip() {
        for s in AccessStrategy::ALL {
            assert_eq!(s.to_string().parse::<AccessStrategy>().unwrap(), s);
        }
        assert_eq!("READ4".parse::<AccessStrategy>().unwrap(), AccessStrategy::Vectorized);
        assert!("tiled".parse::<AccessStrategy>().is_err());
    }
}
