//! In-place normalisation of volumes to 1 mm isotropic, canonically oriented data.

use crate::dataset::VolumePair;
use crate::error::AugmentError;
use crate::interpolator::Interpolator;
use crate::orientation::{AxisCodes, reorient};
use crate::volume::Volume;
use crate::volume_loader::VolumeLoader;

use std::path::Path;
use tracing::{debug, info};

/// A pair whose files on disk now satisfy the normalisation contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedVolume {
    pub pair: VolumePair,
    /// Whether either file had to be resampled.
    pub resampled: bool,
    /// Whether either file had to be reoriented.
    pub reoriented: bool,
}

impl PreparedVolume {
    pub fn was_modified(&self) -> bool {
        self.resampled || self.reoriented
    }
}

#[derive(Clone, Debug)]
pub struct Preprocessor {
    spacing_mm: f32,
    orientation: AxisCodes,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            spacing_mm: 1.0,
            orientation: AxisCodes::RPI,
        }
    }
}

impl Preprocessor {
    pub fn new(spacing_mm: f32, orientation: AxisCodes) -> Self {
        Self {
            spacing_mm,
            orientation,
        }
    }

    /// Resample and reorient both files of `pair`, rewriting them in place.
    ///
    /// Each check is guarded, so running this on an already normalised pair
    /// reads the files and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns error if either file cannot be read or rewritten
    pub fn normalize(&self, pair: &VolumePair) -> Result<PreparedVolume, AugmentError> {
        let image = self.normalize_file(&pair.image)?;
        let segmentation = self.normalize_file(&pair.segmentation)?;
        let prepared = PreparedVolume {
            pair: pair.clone(),
            resampled: image.0 || segmentation.0,
            reoriented: image.1 || segmentation.1,
        };
        if prepared.was_modified() {
            info!(
                image = %pair.image.display(),
                resampled = prepared.resampled,
                reoriented = prepared.reoriented,
                "normalised volume"
            );
        }
        Ok(prepared)
    }

    /// Returns `(resampled, reoriented)` for one file.
    fn normalize_file(&self, path: &Path) -> Result<(bool, bool), AugmentError> {
        let mut volume = VolumeLoader::load(path)?;

        let resampled = !volume.is_isotropic(self.spacing_mm);
        if resampled {
            debug!(path = %path.display(), spacing = ?volume.spacing, "resampling");
            volume = Interpolator::resample_nearest(&volume, self.spacing_mm);
        }

        let current = volume.orientation();
        let reoriented = current != self.orientation;
        if reoriented {
            debug!(path = %path.display(), from = %current, to = %self.orientation, "reorienting");
            volume = reorient(&volume, self.orientation);
        }

        if resampled || reoriented {
            Self::write_back(&volume, path)?;
        }
        Ok((resampled, reoriented))
    }

    fn write_back(volume: &Volume, path: &Path) -> Result<(), AugmentError> {
        VolumeLoader::save(volume, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn las_affine(spacing: (f32, f32, f32)) -> crate::volume::Affine {
        [
            [spacing.0, 0.0, 0.0, 0.0],
            [0.0, -spacing.1, 0.0, 0.0],
            [0.0, 0.0, -spacing.2, 0.0],
        ]
    }

    fn write_pair(dir: &Path, affine: crate::volume::Affine, dims: (usize, usize, usize)) -> VolumePair {
        let image = Array3::from_shape_fn(dims, |(x, y, z)| (x + 10 * y + 100 * z) as f32);
        let seg = image.mapv(|v| if v > 50.0 { 1.0 } else { 0.0 });
        let pair = VolumePair::new(dir.join("vol.nii.gz"), dir.join("vol_seg.nii.gz"));
        VolumeLoader::save(&Volume::with_affine(image, affine), &pair.image).unwrap();
        VolumeLoader::save(&Volume::with_affine(seg, affine), &pair.segmentation).unwrap();
        pair
    }

    #[test]
    fn normalises_spacing_and_orientation_then_is_a_no_op() {
        let dir = tempdir().unwrap();
        let pair = write_pair(dir.path(), las_affine((2.0, 2.0, 1.0)), (4, 3, 5));
        let preprocessor = Preprocessor::default();

        let first = preprocessor.normalize(&pair).unwrap();
        assert!(first.resampled && first.reoriented);

        let image = VolumeLoader::load(&pair.image).unwrap();
        let seg = VolumeLoader::load(&pair.segmentation).unwrap();
        assert_eq!(image.spacing, (1.0, 1.0, 1.0));
        assert_eq!(image.orientation(), AxisCodes::RPI);
        assert_eq!(image.dim(), (8, 6, 5));
        assert_eq!(seg.dim(), image.dim());
        assert!(seg.data.iter().all(|&v| v == 0.0 || v == 1.0));

        let bytes = std::fs::read(&pair.image).unwrap();
        let second = preprocessor.normalize(&pair).unwrap();
        assert!(!second.was_modified());
        assert_eq!(std::fs::read(&pair.image).unwrap(), bytes);
    }

    #[test]
    fn canonical_isotropic_pair_is_left_untouched() {
        let dir = tempdir().unwrap();
        let rpi = [[-1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        let pair = write_pair(dir.path(), rpi, (4, 4, 4));
        let before = std::fs::metadata(&pair.image).unwrap().modified().unwrap();

        let prepared = Preprocessor::default().normalize(&pair).unwrap();

        assert!(!prepared.was_modified());
        assert_eq!(std::fs::metadata(&pair.image).unwrap().modified().unwrap(), before);
    }
}
