// kernel.rs — The convolution kernels, executed on the host.
//
// This is src/shaders/convolution*.wgsl transcribed work-item by work-item,
// so the host device can run the real algorithm (tile load, barrier, window
// sum, centred write) without an accelerator. The golden reference in
// convolution.rs is untiled; comparing the two checks the tiling itself.
// `execute_untiled` is convolution_global.wgsl: no tile, no phases.
//
// EXECUTION MODEL:
// One call to `execute_workgroup` runs one workgroup to completion:
//
//   phase 1   every work-item (ly, lx) runs its strided tile-load loops
//   barrier   the return from the phase-1 loop nest
//   phase 2   every work-item inside the valid region sums its window
//
// Phase 2 never starts before every work-item has finished phase 1, which
// is exactly the guarantee `workgroupBarrier()` gives on the device.
// Work-items skip phase-2 writes, never the barrier.
//
// Writes are returned rather than applied so workgroups can run in parallel
// against a shared read-only input; the caller scatters them afterwards.
//
// Out-of-range accesses are faults here. On a device with robust buffer
// access they would silently read zero or be dropped instead.

use crate::error::DeviceFault;
use crate::program::{missing_arg, KernelArg, KernelArgs};

/// Status code for an access outside a buffer or the tile.
pub const OUT_OF_RANGE: i32 = -5;
/// Status code for a missing or mistyped argument.
pub const INVALID_KERNEL_ARGS: i32 = -52;

/// Scalar arguments of one dispatch, as the kernel sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParams {
    pub rows: usize,
    pub cols: usize,
    pub pitch: usize,
    pub filter_width: usize,
    /// Tile height; 0 for an untiled variant.
    pub local_height: usize,
    pub local_width: usize,
}

impl KernelParams {
    /// Read the scalar slots of `args`. Tile sizes are read only for
    /// variants that use a tile.
    pub fn from_args<B>(args: &KernelArgs<'_, B>) -> Result<Self, DeviceFault> {
        let get = |arg: KernelArg| {
            args.scalar(arg)
                .map(|v| v as usize)
                .ok_or_else(|| DeviceFault::new(INVALID_KERNEL_ARGS, missing_arg(args.variant(), arg)))
        };
        let (local_height, local_width) = if args.variant().uses_tile() {
            (get(KernelArg::LocalHeight)?, get(KernelArg::LocalWidth)?)
        } else {
            (0, 0)
        };
        Ok(KernelParams {
            rows: get(KernelArg::Rows)?,
            cols: get(KernelArg::Cols)?,
            pitch: get(KernelArg::Pitch)?,
            filter_width: get(KernelArg::FilterWidth)?,
            local_height,
            local_width,
        })
    }

    fn radius(&self) -> usize {
        self.filter_width / 2
    }
}

/// How phase 1 reads the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLoad {
    /// One element per step, bounded by the image width.
    Scalar,
    /// Four elements per step, bounded by the device pitch.
    Quad,
}

/// One output element produced by a work-item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelWrite {
    pub index: usize,
    pub value: f32,
}

/// Run workgroup `group` (column, row) to completion.
///
/// `tile` is the workgroup's shared memory. It is not cleared: cells the
/// load skips keep whatever the previous group left there.
#[allow(clippy::too_many_arguments)]
pub fn execute_workgroup(
    params: &KernelParams,
    load: TileLoad,
    workgroup: (u32, u32),
    group: (u32, u32),
    input: &[f32],
    coeffs: &[f32],
    tile: &mut [f32],
    writes: &mut Vec<PixelWrite>,
) -> Result<(), DeviceFault> {
    let (wg_x, wg_y) = (workgroup.0 as usize, workgroup.1 as usize);
    let group_col = group.0 as usize * wg_x;
    let group_row = group.1 as usize * wg_y;

    // Phase 1
    for local_row in 0..wg_y {
        for local_col in 0..wg_x {
            match load {
                TileLoad::Scalar => {
                    load_scalar(params, (group_col, group_row), (local_col, local_row), workgroup, input, tile)?
                }
                TileLoad::Quad => {
                    load_quads(params, (group_col, group_row), (local_col, local_row), workgroup, input, tile)?
                }
            }
        }
    }

    // Barrier: every work-item has finished phase 1.

    // Phase 2
    let radius = params.radius();
    let padding = radius * 2;
    let valid_rows = params.rows.saturating_sub(padding);
    let valid_cols = params.cols.saturating_sub(padding);
    let fw = params.filter_width;

    for local_row in 0..wg_y {
        for local_col in 0..wg_x {
            let global_row = group_row + local_row;
            let global_col = group_col + local_col;
            if global_row >= valid_rows || global_col >= valid_cols {
                continue;
            }

            let mut sum = 0.0f32;
            let mut filter_idx = 0;
            for i in local_row..local_row + fw {
                let offset = i * params.local_width;
                for j in local_col..local_col + fw {
                    let t = read(tile, offset + j, "tile")?;
                    let c = read(coeffs, filter_idx, "coeffs")?;
                    sum += t * c;
                    filter_idx += 1;
                }
            }
            writes.push(PixelWrite {
                index: (global_row + radius) * params.pitch + (global_col + radius),
                value: sum,
            });
        }
    }
    Ok(())
}

/// Run workgroup `group` of the untiled kernel: every valid work-item sums
/// its window straight from `input`.
pub fn execute_untiled(
    params: &KernelParams,
    workgroup: (u32, u32),
    group: (u32, u32),
    input: &[f32],
    coeffs: &[f32],
    writes: &mut Vec<PixelWrite>,
) -> Result<(), DeviceFault> {
    let (wg_x, wg_y) = (workgroup.0 as usize, workgroup.1 as usize);
    let radius = params.radius();
    let valid_rows = params.rows.saturating_sub(radius * 2);
    let valid_cols = params.cols.saturating_sub(radius * 2);
    let fw = params.filter_width;

    for global_row in group.1 as usize * wg_y..(group.1 as usize + 1) * wg_y {
        for global_col in group.0 as usize * wg_x..(group.0 as usize + 1) * wg_x {
            if global_row >= valid_rows || global_col >= valid_cols {
                continue;
            }
            let mut sum = 0.0f32;
            let mut filter_idx = 0;
            for i in 0..fw {
                let offset = (global_row + i) * params.pitch + global_col;
                for j in 0..fw {
                    let v = read(input, offset + j, "image_in")?;
                    let c = read(coeffs, filter_idx, "coeffs")?;
                    sum += v * c;
                    filter_idx += 1;
                }
            }
            writes.push(PixelWrite {
                index: (global_row + radius) * params.pitch + (global_col + radius),
                value: sum,
            });
        }
    }
    Ok(())
}

fn load_scalar(
    params: &KernelParams,
    (group_col, group_row): (usize, usize),
    (local_col, local_row): (usize, usize),
    (wg_x, wg_y): (u32, u32),
    input: &[f32],
    tile: &mut [f32],
) -> Result<(), DeviceFault> {
    for i in (local_row..params.local_height).step_by(wg_y as usize) {
        let cur_row = group_row + i;
        for j in (local_col..params.local_width).step_by(wg_x as usize) {
            let cur_col = group_col + j;
            if cur_row < params.rows && cur_col < params.cols {
                let v = read(input, cur_row * params.pitch + cur_col, "image_in")?;
                store(tile, i * params.local_width + j, v)?;
            }
        }
    }
    Ok(())
}

fn load_quads(
    params: &KernelParams,
    (group_col, group_row): (usize, usize),
    (local_col, local_row): (usize, usize),
    (wg_x, wg_y): (u32, u32),
    input: &[f32],
    tile: &mut [f32],
) -> Result<(), DeviceFault> {
    // Quads start on a multiple of 4; the group origin may not.
    let shift = group_col % 4;
    let base_col = group_col - shift;
    let quads = (shift + params.local_width).div_ceil(4);
    for i in (local_row..params.local_height).step_by(wg_y as usize) {
        let cur_row = group_row + i;
        for q in (local_col..quads).step_by(wg_x as usize) {
            let cur_col = base_col + q * 4;
            if cur_row < params.rows && cur_col < params.pitch {
                // vec4 index, as the kernel computes it.
                let base = (cur_row * params.pitch + cur_col) / 4 * 4;
                for k in 0..4 {
                    let Some(j) = (q * 4 + k).checked_sub(shift) else { continue };
                    if j < params.local_width {
                        let v = read(input, base + k, "image_in")?;
                        store(tile, i * params.local_width + j, v)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[inline]
fn read(buf: &[f32], index: usize, name: &str) -> Result<f32, DeviceFault> {
    buf.get(index).copied().ok_or_else(|| {
        DeviceFault::new(
            OUT_OF_RANGE,
            format!("read of `{name}`[{index}] past its {} elements", buf.len()),
        )
    })
}

#[inline]
fn store(tile: &mut [f32], index: usize, value: f32) -> Result<(), DeviceFault> {
    let len = tile.len();
    match tile.get_mut(index) {
        Some(cell) => {
            *cell = value;
            Ok(())
        }
        None => Err(DeviceFault::new(
            OUT_OF_RANGE,
            format!("store to `tile`[{index}] past its {len} elements"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(rows: usize, cols: usize, pitch: usize, fw: usize, wg: (u32, u32)) -> KernelParams {
        KernelParams {
            rows,
            cols,
            pitch,
            filter_width: fw,
            local_height: wg.1 as usize + fw - 1,
            local_width: wg.0 as usize + fw - 1,
        }
    }

    #[test]
    fn test_single_group_identity_3x3() {
        // 6x6 image, 3x3 identity, one 4x4 group covers the 4x4 valid region.
        let input: Vec<f32> = (0..36).map(|v| v as f32).collect();
        let mut coeffs = vec![0.0; 9];
        coeffs[4] = 1.0;
        let p = params(6, 6, 6, 3, (4, 4));
        let mut tile = vec![f32::NAN; p.local_width * p.local_height];
        let mut writes = Vec::new();
        execute_workgroup(&p, TileLoad::Scalar, (4, 4), (0, 0), &input, &coeffs, &mut tile, &mut writes)
            .unwrap();

        assert_eq!(writes.len(), 16);
        for w in &writes {
            assert_eq!(w.value, input[w.index]);
            let (row, col) = (w.index / 6, w.index % 6);
            assert!((1..5).contains(&row) && (1..5).contains(&col));
        }
    }

    #[test]
    fn test_edge_group_skips_out_of_image_cells() {
        // 9 wide, 4-wide groups: group 1 starts at column 4 and its 6-wide
        // tile would reach column 9, one past the image edge.
        let input = vec![2.0f32; 9 * 6];
        let coeffs = vec![1.0 / 9.0; 9];
        let p = params(6, 9, 9, 3, (4, 4));
        let mut tile = vec![f32::NAN; p.local_width * p.local_height];
        let mut writes = Vec::new();
        execute_workgroup(&p, TileLoad::Scalar, (4, 4), (1, 0), &input, &coeffs, &mut tile, &mut writes)
            .unwrap();

        // Valid columns are 0..7; this group owns 4..7, all four valid rows.
        assert_eq!(writes.len(), 12);
        assert!(writes.iter().all(|w| (w.value - 2.0).abs() < 1e-6));
        // Last tile column was never loaded.
        assert!(tile[p.local_width - 1].is_nan());
        assert!(!tile[p.local_width - 2].is_nan());
    }

    #[test]
    fn test_group_past_valid_region_writes_nothing() {
        let input = vec![1.0f32; 8 * 8];
        let coeffs = vec![0.0; 25];
        let p = params(8, 8, 8, 5, (4, 4));
        let mut tile = vec![0.0; p.local_width * p.local_height];
        let mut writes = Vec::new();
        // Valid region is 4x4; group (1, 1) covers 4..8 in both axes.
        execute_workgroup(&p, TileLoad::Scalar, (4, 4), (1, 1), &input, &coeffs, &mut tile, &mut writes)
            .unwrap();
        assert!(writes.is_empty());
    }

    #[test]
    fn test_quad_load_matches_scalar_load() {
        // pitch 12 (multiple of the 4-wide group), 9 wide image.
        let (rows, cols, pitch) = (7, 9, 12);
        let input: Vec<f32> = (0..rows * pitch).map(|v| (v % 13) as f32 * 0.5).collect();
        let coeffs: Vec<f32> = (0..9).map(|v| v as f32 / 36.0).collect();
        let scalar = params(rows, cols, pitch, 3, (4, 2));
        let quad = KernelParams { local_width: 8, ..scalar };

        for group in [(0, 0), (1, 0), (0, 1), (1, 2)] {
            let mut t1 = vec![f32::NAN; scalar.local_width * scalar.local_height];
            let mut t2 = vec![f32::NAN; quad.local_width * quad.local_height];
            let (mut w1, mut w2) = (Vec::new(), Vec::new());
            execute_workgroup(&scalar, TileLoad::Scalar, (4, 2), group, &input, &coeffs, &mut t1, &mut w1)
                .unwrap();
            execute_workgroup(&quad, TileLoad::Quad, (4, 2), group, &input, &coeffs, &mut t2, &mut w2)
                .unwrap();
            assert_eq!(w1, w2, "group {group:?}");
        }
    }

    #[test]
    fn test_quad_load_realigns_unaligned_group_origin() {
        // 6-wide groups: group 1 starts at column 6, two past a quad boundary.
        // pitch 12 = lcm(6, 4).
        let (rows, cols, pitch) = (6, 11, 12);
        let input: Vec<f32> = (0..rows * pitch).map(|v| v as f32).collect();
        let coeffs: Vec<f32> = (0..9).map(|v| (v + 1) as f32 / 45.0).collect();
        let scalar = params(rows, cols, pitch, 3, (6, 2));
        let quad = KernelParams { local_width: 8, ..scalar };

        for group in [(0, 0), (1, 0), (1, 1)] {
            let mut t1 = vec![f32::NAN; scalar.local_width * scalar.local_height];
            let mut t2 = vec![f32::NAN; quad.local_width * quad.local_height];
            let (mut w1, mut w2) = (Vec::new(), Vec::new());
            execute_workgroup(&scalar, TileLoad::Scalar, (6, 2), group, &input, &coeffs, &mut t1, &mut w1)
                .unwrap();
            execute_workgroup(&quad, TileLoad::Quad, (6, 2), group, &input, &coeffs, &mut t2, &mut w2)
                .unwrap();
            assert_eq!(w1, w2, "group {group:?}");
        }

        // Tile cell 0 of group 1 holds column 6, not the quad start at 4.
        let mut tile = vec![f32::NAN; quad.local_width * quad.local_height];
        execute_workgroup(&quad, TileLoad::Quad, (6, 2), (1, 0), &input, &coeffs, &mut tile, &mut Vec::new())
            .unwrap();
        assert_eq!(tile[0], 6.0);
        assert_eq!(tile[5], 11.0);
        // Columns 12 and 13 are past the pitch.
        assert!(tile[6].is_nan() && tile[7].is_nan());
    }

    #[test]
    fn test_untiled_matches_tiled() {
        let (rows, cols, pitch) = (11, 13, 16);
        let input: Vec<f32> = (0..rows * pitch).map(|v| ((v * 7) % 19) as f32 - 9.0).collect();
        let coeffs: Vec<f32> = (0..25).map(|v| (v as f32 - 12.0) / 25.0).collect();
        let tiled = params(rows, cols, pitch, 5, (4, 4));
        let untiled = KernelParams { local_height: 0, local_width: 0, ..tiled };

        for group in [(0, 0), (1, 0), (1, 1), (2, 1)] {
            let mut tile = vec![f32::NAN; tiled.local_width * tiled.local_height];
            let (mut w1, mut w2) = (Vec::new(), Vec::new());
            execute_workgroup(&tiled, TileLoad::Scalar, (4, 4), group, &input, &coeffs, &mut tile, &mut w1)
                .unwrap();
            execute_untiled(&untiled, (4, 4), group, &input, &coeffs, &mut w2).unwrap();
            assert_eq!(w1, w2, "group {group:?}");
        }
    }

    #[test]
    fn test_untiled_short_input_faults() {
        let p = KernelParams { rows: 6, cols: 6, pitch: 6, filter_width: 3, local_height: 0, local_width: 0 };
        let err = execute_untiled(&p, (4, 4), (0, 0), &[1.0; 20], &[0.0; 9], &mut Vec::new()).unwrap_err();
        assert_eq!(err.code, Some(OUT_OF_RANGE));
    }

    #[test]
    fn test_small_tile_faults() {
        let input = vec![1.0f32; 36];
        let coeffs = vec![0.0; 9];
        let p = params(6, 6, 6, 3, (4, 4));
        let mut tile = vec![0.0; 4];
        let mut writes = Vec::new();
        let err = execute_workgroup(&p, TileLoad::Scalar, (4, 4), (0, 0), &input, &coeffs, &mut tile, &mut writes)
            .unwrap_err();
        assert_eq!(err.code, Some(OUT_OF_RANGE));
    }
}
