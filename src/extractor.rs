use crate::dataset::VolumePair;
use crate::error::AugmentError;
use crate::slice_cache::{CropSpec, SliceCache, SliceKey};
use crate::volume::Volume;
use crate::volume_loader::VolumeLoader;

use rand::Rng;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use tracing::debug;

/// A cached 2D crop of one slice and its segmentation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedSlice {
    pub volume_id: String,
    pub index: usize,
    pub image: PathBuf,
    pub segmentation: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Slice indices that may be drawn from a volume of `depth` planes.
///
/// The first and last planes are never used.
pub fn usable_indices(depth: usize) -> Option<RangeInclusive<usize>> {
    (depth >= 3).then(|| 1..=depth - 2)
}

/// Draw a slice index uniformly from [`usable_indices`].
pub fn draw_slice_index<R: Rng>(
    rng: &mut R,
    depth: usize,
    path: &std::path::Path,
) -> Result<usize, AugmentError> {
    let range = usable_indices(depth).ok_or_else(|| AugmentError::NoUsableSlices {
        path: path.to_path_buf(),
        depth,
    })?;
    Ok(rng.gen_range(range))
}

/// Start of a `size`-long window centred on `center`, kept inside `[0, extent)`.
fn crop_start(extent: usize, size: usize, center: f32) -> usize {
    let start = (center - (size as f32 - 1.0) / 2.0).round().max(0.0) as usize;
    start.min(extent - size)
}

pub struct SliceExtractor {
    cache: SliceCache,
    crop: CropSpec,
}

impl SliceExtractor {
    pub fn new(cache: SliceCache, out_size: (usize, usize), center_on_segmentation: bool) -> Self {
        Self {
            cache,
            crop: CropSpec::new(out_size, center_on_segmentation),
        }
    }

    pub fn cache(&self) -> &SliceCache {
        &self.cache
    }

    pub fn crop(&self) -> CropSpec {
        self.crop
    }

    /// Extract slice `index` of `pair`, reusing the cached entry when present.
    ///
    /// # Errors
    ///
    /// Returns error if `index` is outside the volume, the slice is smaller
    /// than the output size, or the volumes cannot be read or written
    pub fn extract(
        &self,
        pair: &VolumePair,
        index: usize,
    ) -> Result<(ExtractedSlice, CacheStatus), AugmentError> {
        let key = SliceKey::new(pair, index, self.crop);
        if let Some(entry) = self.cache.lookup(&key) {
            return Ok((entry, CacheStatus::Hit));
        }
        let image = VolumeLoader::load(&pair.image)?;
        let segmentation = VolumeLoader::load(&pair.segmentation)?;
        let entry = self.build(pair, &key, &image, &segmentation)?;
        Ok((entry, CacheStatus::Miss))
    }

    /// Draw a usable slice index for `pair` and extract it.
    pub fn extract_random<R: Rng>(
        &self,
        pair: &VolumePair,
        rng: &mut R,
    ) -> Result<(ExtractedSlice, CacheStatus), AugmentError> {
        let (_, _, depth) = VolumeLoader::load_dimensions(&pair.image)?;
        let index = draw_slice_index(rng, depth, &pair.image)?;
        self.extract(pair, index)
    }

    /// Extract every usable slice of `pair`, loading the volumes at most once.
    pub fn extract_all(&self, pair: &VolumePair) -> Result<Vec<ExtractedSlice>, AugmentError> {
        let (_, _, depth) = VolumeLoader::load_dimensions(&pair.image)?;
        let indices = usable_indices(depth).ok_or_else(|| AugmentError::NoUsableSlices {
            path: pair.image.clone(),
            depth,
        })?;

        let mut loaded: Option<(Volume, Volume)> = None;
        let mut slices = Vec::with_capacity(indices.clone().count());
        for index in indices {
            let key = SliceKey::new(pair, index, self.crop);
            if let Some(entry) = self.cache.lookup(&key) {
                slices.push(entry);
                continue;
            }
            if loaded.is_none() {
                loaded = Some((
                    VolumeLoader::load(&pair.image)?,
                    VolumeLoader::load(&pair.segmentation)?,
                ));
            }
            if let Some((image, segmentation)) = &loaded {
                slices.push(self.build(pair, &key, image, segmentation)?);
            }
        }
        Ok(slices)
    }

    fn build(
        &self,
        pair: &VolumePair,
        key: &SliceKey,
        image: &Volume,
        segmentation: &Volume,
    ) -> Result<ExtractedSlice, AugmentError> {
        if image.dim() != segmentation.dim() {
            return Err(AugmentError::GeometryMismatch {
                image: pair.image.clone(),
                segmentation: pair.segmentation.clone(),
            });
        }
        let index = key.index;
        let out_of_bounds = || AugmentError::SliceIndexOutOfBounds {
            path: pair.image.clone(),
            index,
            depth: image.depth(),
        };
        let image_plane = image.slice_volume(index).ok_or_else(out_of_bounds)?;
        let seg_plane = segmentation.slice_volume(index).ok_or_else(out_of_bounds)?;

        let (nx, ny, _) = image_plane.dim();
        let (size_x, size_y) = self.crop.size;
        if nx < size_x || ny < size_y {
            return Err(AugmentError::SliceTooSmall {
                path: pair.image.clone(),
                actual: (nx, ny),
                requested: self.crop.size,
            });
        }

        let geometric_center = ((nx as f32 - 1.0) / 2.0, (ny as f32 - 1.0) / 2.0);
        let (cx, cy) = if self.crop.centered {
            seg_plane
                .foreground_bounds(0)
                .map(|bounds| bounds.center())
                .unwrap_or(geometric_center)
        } else {
            geometric_center
        };
        let x0 = crop_start(nx, size_x, cx);
        let y0 = crop_start(ny, size_y, cy);

        debug!(volume = %key.volume_id, index, x0, y0, "cropping slice");
        self.cache.publish(
            key,
            &image_plane.crop_xy(x0, y0, size_x, size_y),
            &seg_plane.crop_xy(x0, y0, size_x, size_y),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_pair(dir: &Path, name: &str, dims: (usize, usize, usize)) -> VolumePair {
        let image = Array3::from_shape_fn(dims, |(x, y, z)| (x + 100 * y + 10_000 * z) as f32);
        let mut seg = Array3::<f32>::zeros(dims);
        for z in 0..dims.2 {
            seg[[dims.0 - 3, dims.1 - 3, z]] = 1.0;
            seg[[dims.0 - 2, dims.1 - 2, z]] = 1.0;
        }
        let pair = VolumePair::new(
            dir.join(format!("{name}.nii.gz")),
            dir.join(format!("{name}_seg.nii.gz")),
        );
        VolumeLoader::save(&Volume::new(image, (1.0, 1.0, 1.0)), &pair.image).unwrap();
        VolumeLoader::save(&Volume::new(seg, (1.0, 1.0, 1.0)), &pair.segmentation).unwrap();
        pair
    }

    #[test]
    fn drawn_indices_skip_boundary_planes() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for depth in 3..12 {
            for _ in 0..200 {
                let index = draw_slice_index(&mut rng, depth, Path::new("v")).unwrap();
                assert!((1..=depth - 2).contains(&index));
            }
        }
        assert!(draw_slice_index(&mut rng, 2, Path::new("v")).is_err());
    }

    #[test]
    fn crop_window_is_clamped_inside_extent() {
        assert_eq!(crop_start(10, 4, 4.5), 3);
        assert_eq!(crop_start(10, 4, 0.0), 0);
        assert_eq!(crop_start(10, 4, 9.0), 6);
        assert_eq!(crop_start(4, 4, 1.5), 0);
    }

    #[test]
    fn second_extraction_is_a_byte_identical_cache_hit() {
        let data = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let pair = write_pair(data.path(), "sub-01_t2", (12, 10, 6));
        let extractor = SliceExtractor::new(SliceCache::new(cache.path()), (6, 4), false);

        let (first, status) = extractor.extract(&pair, 2).unwrap();
        assert_eq!(status, CacheStatus::Miss);
        let bytes = fs::read(&first.image).unwrap();

        let (second, status) = extractor.extract(&pair, 2).unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(first, second);
        assert_eq!(fs::read(&second.image).unwrap(), bytes);
    }

    #[test]
    fn crops_have_requested_size_and_follow_segmentation() {
        let data = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let pair = write_pair(data.path(), "sub-02_t2", (12, 10, 6));

        let centred = SliceExtractor::new(SliceCache::new(cache.path()), (4, 4), true);
        let (slice, _) = centred.extract(&pair, 3).unwrap();
        let image = VolumeLoader::load(&slice.image).unwrap();
        let seg = VolumeLoader::load(&slice.segmentation).unwrap();

        assert_eq!(image.dim(), (4, 4, 1));
        assert_eq!(seg.dim(), (4, 4, 1));
        // Foreground sits at x 9..=10, y 7..=8, so the window is pushed to the far corner
        assert_eq!(image.data[[0, 0, 0]], (8 + 100 * 6 + 10_000 * 3) as f32);
        assert_eq!(seg.data.iter().filter(|&&v| v != 0.0).count(), 2);
    }

    #[test]
    fn same_named_volumes_in_sibling_folders_do_not_share_slices() {
        let data = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let mut pairs = Vec::new();
        for (folder, value) in [("patient-a", 1.0), ("patient-b", 2.0)] {
            let dir = data.path().join(folder);
            let pair = VolumePair::new(dir.join("t2.nii.gz"), dir.join("t2_seg.nii.gz"));
            let volume = Volume::new(Array3::from_elem((8, 8, 5), value), (1.0, 1.0, 1.0));
            VolumeLoader::save(&volume, &pair.image).unwrap();
            VolumeLoader::save(&volume, &pair.segmentation).unwrap();
            pairs.push(pair);
        }
        let extractor = SliceExtractor::new(SliceCache::new(cache.path()), (4, 4), false);

        let (a, status_a) = extractor.extract(&pairs[0], 2).unwrap();
        let (b, status_b) = extractor.extract(&pairs[1], 2).unwrap();

        assert_eq!((status_a, status_b), (CacheStatus::Miss, CacheStatus::Miss));
        assert_ne!(a.image, b.image);
        assert_eq!(a.volume_id, b.volume_id);
        let b_image = VolumeLoader::load(&b.image).unwrap();
        assert!(b_image.data.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn cached_slices_are_not_reused_across_crop_settings() {
        let data = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let pair = write_pair(data.path(), "sub-05_t2", (12, 10, 6));

        let large = SliceExtractor::new(SliceCache::new(cache.path()), (8, 8), false);
        let small = SliceExtractor::new(SliceCache::new(cache.path()), (4, 4), false);
        let centred = SliceExtractor::new(SliceCache::new(cache.path()), (8, 8), true);

        let (first, status) = large.extract(&pair, 2).unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(VolumeLoader::load(&first.image).unwrap().dim(), (8, 8, 1));

        let (second, status) = small.extract(&pair, 2).unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(VolumeLoader::load(&second.image).unwrap().dim(), (4, 4, 1));
        assert_eq!(VolumeLoader::load(&second.segmentation).unwrap().dim(), (4, 4, 1));

        let (_, status) = centred.extract(&pair, 2).unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(large.extract(&pair, 2).unwrap().1, CacheStatus::Hit);
    }

    #[test]
    fn out_of_range_index_and_small_slices_are_rejected() {
        let data = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let pair = write_pair(data.path(), "sub-03_t2", (6, 6, 4));

        let extractor = SliceExtractor::new(SliceCache::new(cache.path()), (4, 4), false);
        assert!(matches!(
            extractor.extract(&pair, 4),
            Err(AugmentError::SliceIndexOutOfBounds { index: 4, depth: 4, .. })
        ));

        let too_big = SliceExtractor::new(SliceCache::new(cache.path()), (8, 4), false);
        assert!(matches!(
            too_big.extract(&pair, 1),
            Err(AugmentError::SliceTooSmall { .. })
        ));
    }

    #[test]
    fn extract_all_covers_usable_indices() {
        let data = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let pair = write_pair(data.path(), "sub-04_t2", (8, 8, 5));
        let extractor = SliceExtractor::new(SliceCache::new(cache.path()), (4, 4), false);

        let slices = extractor.extract_all(&pair).unwrap();
        let indices: Vec<_> = slices.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(slices.iter().all(|s| s.image.is_file() && s.segmentation.is_file()));
    }
}
