use crate::format_reader::VoxelGrid;
use crate::interpolator::Interpolator;

use log::debug;
use ndarray::{Array3, Zip};
use rayon::prelude::*;

/// Per-axis cap on the rendered volume.
pub const MAX_VOLUME_SIZE: usize = 128;
/// Voxel budget for the rendered volume.
pub const MAX_VOXELS: usize = MAX_VOLUME_SIZE * MAX_VOLUME_SIZE * MAX_VOLUME_SIZE;

/// A normalized, GPU-sized volume ready for upload.
///
/// Every value lies in [0, 1]. The data array is indexed (z, y, x), which
/// makes its standard layout the x-fastest order a 3D texture expects.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeData {
    data: Array3<f32>,
    spacing: Option<(f32, f32, f32)>,
    min_max: (f64, f64),
}

impl VolumeData {
    /// Get the dimensions of the volume as (nx, ny, nz)
    pub fn dims(&self) -> (usize, usize, usize) {
        let (depth, height, width) = self.data.dim();
        (width, height, depth)
    }

    /// Get a reference to the underlying (z, y, x) data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> Option<(f32, f32, f32)> {
        self.spacing
    }

    /// Source intensity range that was mapped onto [0, 1].
    pub fn min_max(&self) -> (f64, f64) {
        self.min_max
    }

    /// Physical extent along each axis, falling back to one unit per voxel.
    pub fn extent(&self) -> (f32, f32, f32) {
        let (nx, ny, nz) = self.dims();
        let (sx, sy, sz) = self.spacing.unwrap_or((1.0, 1.0, 1.0));
        (nx as f32 * sx, ny as f32 * sy, nz as f32 * sz)
    }
}

/// Rescale a voxel grid to [0, 1] and shrink it below [`MAX_VOXELS`].
///
/// When the grid already fits, the extrema come from every sample. When it
/// has to be resampled, only the nearest-neighbour samples that end up in
/// the output take part in the min/max; skipped samples never affect the
/// intensity range.
///
/// A constant grid normalizes to all zeros. Non-finite float samples are
/// ignored for the range and written as zero.
pub fn normalize_and_downsample(grid: &VoxelGrid) -> VolumeData {
    let (nx, ny, nz) = grid.dims();
    let (out_x, out_y, out_z) = Interpolator::get_downsampled_dimensions(grid.dims(), MAX_VOXELS);

    let xs = Interpolator::nearest_source_indices(out_x, nx);
    let ys = Interpolator::nearest_source_indices(out_y, ny);
    let zs = Interpolator::nearest_source_indices(out_z, nz);

    let samples = grid.samples();
    let mut gathered = Array3::<f64>::zeros((out_z, out_y, out_x));
    Zip::indexed(&mut gathered).par_for_each(|(z, y, x), value| {
        *value = samples.value_at(zs[z] * nx * ny + ys[y] * nx + xs[x]);
    });

    let (min, max) = gathered
        .as_slice()
        .map(|values| {
            values
                .par_iter()
                .filter(|v| v.is_finite())
                .fold(
                    || (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo, hi), &v| (lo.min(v), hi.max(v)),
                )
                .reduce(
                    || (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo_a, hi_a), (lo_b, hi_b)| (lo_a.min(lo_b), hi_a.max(hi_b)),
                )
        })
        .unwrap_or((f64::INFINITY, f64::NEG_INFINITY));
    let (min, max) = if min <= max { (min, max) } else { (0.0, 0.0) };
    let range = if max - min == 0.0 { 1.0 } else { max - min };

    let mut data = Array3::<f32>::zeros((out_z, out_y, out_x));
    Zip::from(&mut data)
        .and(&gathered)
        .par_for_each(|out, &value| {
            *out = if value.is_finite() {
                ((value - min) / range) as f32
            } else {
                0.0
            };
        });

    let spacing = grid.spacing().map(|(sx, sy, sz)| {
        (
            sx * nx as f32 / out_x as f32,
            sy * ny as f32 / out_y as f32,
            sz * nz as f32 / out_z as f32,
        )
    });

    debug!(
        "normalized {:?} -> {:?}, range [{min}, {max}]",
        (nx, ny, nz),
        (out_x, out_y, out_z)
    );

    VolumeData {
        data,
        spacing,
        min_max: (min, max),
    }
}
