use ndarray::ArrayView3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Shrink (nx, ny, nz) by one isotropic factor so the product lands near
    /// `max_voxels`. Each axis is rounded on its own, so the result may
    /// overshoot the budget slightly.
    pub(crate) fn get_downsampled_dimensions(
        dims: (usize, usize, usize),
        max_voxels: usize,
    ) -> (usize, usize, usize) {
        let (nx, ny, nz) = dims;
        let total = nx * ny * nz;
        if total <= max_voxels {
            return dims;
        }

        let scale = (max_voxels as f64 / total as f64).cbrt();
        let shrink = |n: usize| ((n as f64 * scale).round() as usize).max(1);

        (shrink(nx), shrink(ny), shrink(nz))
    }

    /// Nearest-neighbour source index along one axis for every output index.
    pub(crate) fn nearest_source_indices(output_len: usize, source_len: usize) -> Vec<usize> {
        (0..output_len)
            .map(|i| {
                let src = ((i as f64 / output_len as f64) * source_len as f64).floor() as usize;
                src.min(source_len - 1)
            })
            .collect()
    }

    /// Sample a (z, y, x) volume at normalized texture coordinates the way a
    /// linearly filtered, clamp-to-edge 3D texture does.
    pub(crate) fn trilinear_sample(volume: &ArrayView3<'_, f32>, coords: [f32; 3]) -> f32 {
        let (depth, height, width) = volume.dim();

        let texel = |t: f32, n: usize| -> (usize, usize, f32) {
            let src = (t * n as f32 - 0.5).clamp(0.0, (n - 1) as f32);
            let i0 = src.floor() as usize;
            let i1 = (i0 + 1).min(n - 1);
            (i0, i1, src - i0 as f32)
        };
        let (x0, x1, dx) = texel(coords[0], width);
        let (y0, y1, dy) = texel(coords[1], height);
        let (z0, z1, dz) = texel(coords[2], depth);

        let bilinear = |z: usize| -> f32 {
            let v00 = volume[[z, y0, x0]];
            let v01 = volume[[z, y0, x1]];
            let v10 = volume[[z, y1, x0]];
            let v11 = volume[[z, y1, x1]];

            let v0 = v00.mul_add(1.0 - dx, v01 * dx);
            let v1 = v10.mul_add(1.0 - dx, v11 * dx);
            v0.mul_add(1.0 - dy, v1 * dy)
        };

        bilinear(z0).mul_add(1.0 - dz, bilinear(z1) * dz)
    }
}
