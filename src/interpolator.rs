use crate::volume::{Affine, Volume};

use ndarray::{Array3, Zip};

pub(crate) struct Interpolator;

impl Interpolator {
    /// Grid size after resampling every axis to `target_spacing` millimetres.
    pub(crate) fn get_isotropic_dimensions(
        spacing: (f32, f32, f32),
        original_dim: (usize, usize, usize),
        target_spacing: f32,
    ) -> (usize, usize, usize) {
        let (x_spacing, y_spacing, z_spacing) = spacing;
        let inv_target = 1.0 / target_spacing; // Multiply instead of divide

        let scale = |n: usize, s: f32| ((n as f32 * s * inv_target).round() as usize).max(1);

        (
            scale(original_dim.0, x_spacing),
            scale(original_dim.1, y_spacing),
            scale(original_dim.2, z_spacing),
        )
    }

    #[inline]
    fn nearest_index(out_index: usize, step: f32, in_len: usize) -> usize {
        // Voxel centres: output voxel i sits at (i + 0.5) * step - 0.5 in source voxel units
        let src = (out_index as f32 + 0.5) * step - 0.5;
        (src.round().max(0.0) as usize).min(in_len - 1)
    }

    /// Nearest-neighbour resampling onto an isotropic grid.
    ///
    /// Labels survive untouched, which is why both the image and its
    /// segmentation go through this path.
    pub(crate) fn resample_nearest(volume: &Volume, target_spacing: f32) -> Volume {
        let (nx, ny, nz) = volume.dim();
        let (ox, oy, oz) =
            Self::get_isotropic_dimensions(volume.spacing, (nx, ny, nz), target_spacing);
        let (sx, sy, sz) = volume.spacing;
        let steps = [target_spacing / sx, target_spacing / sy, target_spacing / sz];

        let src = &volume.data;
        let mut data = Array3::<f32>::zeros((ox, oy, oz));
        Zip::indexed(&mut data).par_for_each(|(i, j, k), value| {
            *value = src[[
                Self::nearest_index(i, steps[0], nx),
                Self::nearest_index(j, steps[1], ny),
                Self::nearest_index(k, steps[2], nz),
            ]];
        });

        let origin = volume.voxel_to_world([
            0.5 * steps[0] - 0.5,
            0.5 * steps[1] - 0.5,
            0.5 * steps[2] - 0.5,
        ]);
        let old = &volume.affine;
        let mut affine: Affine = [[0.0; 4]; 3];
        for row in 0..3 {
            for (col, step) in steps.iter().enumerate() {
                affine[row][col] = old[row][col] * step;
            }
            affine[row][3] = origin[row];
        }

        Volume {
            data,
            spacing: (target_spacing, target_spacing, target_spacing),
            affine,
        }
    }
}
