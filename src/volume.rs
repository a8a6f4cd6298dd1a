use crate::orientation::AxisCodes;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::Axis;
use ndarray::s;

/// Voxel-to-world transform as the three sform rows of a NIfTI header.
pub type Affine = [[f32; 4]; 3];

/// A scalar volume indexed `[x, y, z]` together with its geometry.
#[derive(Clone, Debug)]
pub struct Volume {
    pub data: Array3<f32>,
    pub spacing: (f32, f32, f32),
    pub affine: Affine,
}

/// Inclusive bounding box `(min, max)` of nonzero voxels in an x/y plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneBounds {
    pub x: (usize, usize),
    pub y: (usize, usize),
}

impl PlaneBounds {
    pub fn center(&self) -> (f32, f32) {
        (
            (self.x.0 + self.x.1) as f32 / 2.0,
            (self.y.0 + self.y.1) as f32 / 2.0,
        )
    }
}

impl Volume {
    /// Axis-aligned volume with the given spacing and origin at zero.
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32)) -> Self {
        let (sx, sy, sz) = spacing;
        Self {
            data,
            spacing,
            affine: [
                [sx, 0.0, 0.0, 0.0],
                [0.0, sy, 0.0, 0.0],
                [0.0, 0.0, sz, 0.0],
            ],
        }
    }

    /// Volume whose spacing is taken from the column norms of `affine`.
    pub fn with_affine(data: Array3<f32>, affine: Affine) -> Self {
        let norm = |c: usize| {
            (affine[0][c] * affine[0][c] + affine[1][c] * affine[1][c] + affine[2][c] * affine[2][c])
                .sqrt()
        };
        Self {
            data,
            spacing: (norm(0), norm(1), norm(2)),
            affine,
        }
    }

    /// Get the dimensions of the volume (nx, ny, nz)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Dimensions including the (always singleton) time axis.
    pub fn dimensions(&self) -> (usize, usize, usize, usize) {
        let (nx, ny, nz) = self.dim();
        (nx, ny, nz, 1)
    }

    pub fn voxel_spacing(&self) -> (f32, f32, f32, f32) {
        let (px, py, pz) = self.spacing;
        (px, py, pz, 1.0)
    }

    pub fn orientation(&self) -> AxisCodes {
        AxisCodes::from_affine(&self.affine)
    }

    pub fn depth(&self) -> usize {
        self.data.dim().2
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn is_isotropic(&self, spacing_mm: f32) -> bool {
        self.spacing == (spacing_mm, spacing_mm, spacing_mm)
    }

    /// World coordinates of a (possibly fractional) voxel position.
    pub fn voxel_to_world(&self, voxel: [f32; 3]) -> [f32; 3] {
        let a = &self.affine;
        let row = |r: usize| a[r][0] * voxel[0] + a[r][1] * voxel[1] + a[r][2] * voxel[2] + a[r][3];
        [row(0), row(1), row(2)]
    }

    pub fn is_valid_index(&self, index: usize) -> bool {
        index < self.depth()
    }

    pub fn get_slice(&self, index: usize) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index) {
            return None;
        }
        Some(self.data.slice(s![.., .., index]))
    }

    /// Single-plane volume holding slice `index`, with its origin moved onto that plane.
    pub fn slice_volume(&self, index: usize) -> Option<Volume> {
        let plane = self.get_slice(index)?;
        let data = plane.to_owned().insert_axis(Axis(2));
        Some(self.region(data, [0.0, 0.0, index as f32]))
    }

    /// Crop a `size_x` by `size_y` window starting at `(x0, y0)` in every plane.
    ///
    /// The caller guarantees the window lies inside the volume.
    pub fn crop_xy(&self, x0: usize, y0: usize, size_x: usize, size_y: usize) -> Volume {
        let data = self
            .data
            .slice(s![x0..x0 + size_x, y0..y0 + size_y, ..])
            .to_owned();
        self.region(data, [x0 as f32, y0 as f32, 0.0])
    }

    fn region(&self, data: Array3<f32>, offset: [f32; 3]) -> Volume {
        let origin = self.voxel_to_world(offset);
        let mut affine = self.affine;
        for (row, value) in affine.iter_mut().zip(origin) {
            row[3] = value;
        }
        Volume {
            data,
            spacing: self.spacing,
            affine,
        }
    }

    /// Bounding box of nonzero voxels in plane `index`, if any.
    pub fn foreground_bounds(&self, index: usize) -> Option<PlaneBounds> {
        let plane = self.get_slice(index)?;
        let mut bounds: Option<PlaneBounds> = None;
        for ((x, y), &value) in plane.indexed_iter() {
            if value == 0.0 {
                continue;
            }
            bounds = Some(match bounds {
                None => PlaneBounds {
                    x: (x, x),
                    y: (y, y),
                },
                Some(b) => PlaneBounds {
                    x: (b.x.0.min(x), b.x.1.max(x)),
                    y: (b.y.0.min(y), b.y.1.max(y)),
                },
            });
        }
        bounds
    }

    #[inline]
    fn normalize_to_u8(value: f32, min: f32, range: f32) -> u8 {
        if range <= 0.0 {
            return 0;
        }
        (((value - min) / range) * 255.0).clamp(0.0, 255.0) as u8
    }

    /// Render the middle plane as an 8-bit grayscale image, min-max normalised.
    pub fn to_image(&self) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let plane = self.get_slice(self.depth() / 2)?;
        Self::slice_to_image(&plane)
    }

    // Rows of the image follow y, columns follow x
    fn slice_to_image(slice: &ArrayView2<'_, f32>) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (width, height) = slice.dim();
        let (min, max) = slice
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        let pixel_data: Vec<u8> = slice
            .t()
            .iter()
            .map(|&v| Self::normalize_to_u8(v, min, range))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }
}
