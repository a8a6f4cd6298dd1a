//! Filesystem cache of extracted slices.
//!
//! Entries live in `<root>/Slices_<cache id>/<crop>/` and outlive a single
//! run. The cache id combines the volume's file stem with a digest of its
//! location, and `<crop>` encodes the output size and centring mode, so an
//! entry is only ever reused for the same file cropped the same way.
//! A pair is published segmentation first, image last, each through an
//! atomic rename; the image file is therefore the commit marker and a
//! lookup only reports an entry once both files are complete.

use crate::dataset::VolumePair;
use crate::error::AugmentError;
use crate::extractor::ExtractedSlice;
use crate::volume::Volume;
use crate::volume_loader::VolumeLoader;

use std::path::{Path, PathBuf};

/// How a slice is cropped before it is cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CropSpec {
    pub size: (usize, usize),
    pub centered: bool,
}

impl CropSpec {
    pub fn new(size: (usize, usize), centered: bool) -> Self {
        Self { size, centered }
    }

    /// `<x>x<y>`, with a `_seg-centered` suffix when centred on the segmentation.
    pub fn dir_name(&self) -> String {
        let (x, y) = self.size;
        if self.centered {
            format!("{x}x{y}_seg-centered")
        } else {
            format!("{x}x{y}")
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SliceKey {
    /// File stem, used in cached file names.
    pub volume_id: String,
    /// Stem plus location digest, naming the cache folder.
    pub cache_id: String,
    pub index: usize,
    pub crop: CropSpec,
}

impl SliceKey {
    pub fn new(pair: &VolumePair, index: usize, crop: CropSpec) -> Self {
        Self {
            volume_id: pair.id(),
            cache_id: pair.cache_id(),
            index,
            crop,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SliceCache {
    root: PathBuf,
}

impl SliceCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder(&self, cache_id: &str) -> PathBuf {
        self.root.join(format!("Slices_{cache_id}"))
    }

    /// Conventional location of the entry for `key`, whether or not it exists.
    pub fn entry(&self, key: &SliceKey) -> ExtractedSlice {
        let folder = self.folder(&key.cache_id).join(key.crop.dir_name());
        let SliceKey {
            volume_id, index, ..
        } = key;
        ExtractedSlice {
            volume_id: volume_id.clone(),
            index: *index,
            image: folder.join(format!("{volume_id}_crop_{index}_o0.nii.gz")),
            segmentation: folder.join(format!("{volume_id}_crop_{index}_seg_o0.nii.gz")),
        }
    }

    pub fn lookup(&self, key: &SliceKey) -> Option<ExtractedSlice> {
        let entry = self.entry(key);
        (entry.image.is_file() && entry.segmentation.is_file()).then_some(entry)
    }

    /// Store a freshly cropped image/segmentation pair under `key`.
    pub fn publish(
        &self,
        key: &SliceKey,
        image: &Volume,
        segmentation: &Volume,
    ) -> Result<ExtractedSlice, AugmentError> {
        let entry = self.entry(key);
        VolumeLoader::save(segmentation, &entry.segmentation)?;
        VolumeLoader::save(image, &entry.image)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::tempdir;

    fn pair(image: &str) -> VolumePair {
        VolumePair::new(image, image.replace(".nii.gz", "_seg.nii.gz"))
    }

    #[test]
    fn entry_paths_follow_cache_layout() {
        let cache = SliceCache::new("/cache");
        let volume = pair("/data/sub-01_t2.nii.gz");
        let entry = cache.entry(&SliceKey::new(&volume, 7, CropSpec::new((40, 32), false)));

        let folder = cache.folder(&volume.cache_id()).join("40x32");
        assert!(volume.cache_id().starts_with("sub-01_t2_"));
        assert_eq!(entry.volume_id, "sub-01_t2");
        assert_eq!(entry.image, folder.join("sub-01_t2_crop_7_o0.nii.gz"));
        assert_eq!(entry.segmentation, folder.join("sub-01_t2_crop_7_seg_o0.nii.gz"));
    }

    #[test]
    fn same_stem_in_different_folders_gets_separate_entries() {
        let cache = SliceCache::new("/cache");
        let crop = CropSpec::new((8, 8), false);
        let a = cache.entry(&SliceKey::new(&pair("/data/patient-a/t2.nii.gz"), 2, crop));
        let b = cache.entry(&SliceKey::new(&pair("/data/patient-b/t2.nii.gz"), 2, crop));

        assert_eq!(a.volume_id, b.volume_id);
        assert_ne!(a.image, b.image);
        assert_ne!(a.image.parent(), b.image.parent());
    }

    #[test]
    fn crop_settings_select_separate_entries() {
        let cache = SliceCache::new("/cache");
        let volume = pair("/data/t2.nii.gz");
        let paths: Vec<_> = [
            CropSpec::new((8, 8), false),
            CropSpec::new((4, 4), false),
            CropSpec::new((8, 8), true),
        ]
        .into_iter()
        .map(|crop| cache.entry(&SliceKey::new(&volume, 3, crop)).image)
        .collect();

        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[0], paths[2]);
        assert_ne!(paths[1], paths[2]);
    }

    #[test]
    fn lookup_requires_both_files() {
        let dir = tempdir().unwrap();
        let cache = SliceCache::new(dir.path());
        let key = SliceKey::new(&pair("vol.nii.gz"), 3, CropSpec::new((4, 4), false));
        assert!(cache.lookup(&key).is_none());

        let plane = Volume::new(Array3::zeros((4, 4, 1)), (1.0, 1.0, 1.0));
        let entry = cache.entry(&key);
        VolumeLoader::save(&plane, &entry.segmentation).unwrap();
        assert!(cache.lookup(&key).is_none());

        let published = cache.publish(&key, &plane, &plane).unwrap();
        assert_eq!(cache.lookup(&key), Some(published));
    }
}
