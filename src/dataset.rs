//! Dataset indexing and random sampling of volume pairs.

use crate::enums::Role;
use crate::error::AugmentError;

use rand::Rng;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files left behind by desktop environments that are never volumes.
const HOUSEKEEPING_FILES: [&str; 3] = [".DS_Store", "Thumbs.db", "desktop.ini"];

/// Tokens marking a file name as a segmentation rather than an image.
const SEGMENTATION_TOKENS: [&str; 2] = ["seg", "gmseg"];

/// Hex digits of the location digest kept in a cache id.
const LOCATION_DIGEST_CHARS: usize = 12;

/// An image together with its segmentation mask.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumePair {
    pub image: PathBuf,
    pub segmentation: PathBuf,
}

impl VolumePair {
    pub fn new(image: impl Into<PathBuf>, segmentation: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            segmentation: segmentation.into(),
        }
    }

    /// Identifier of the image, used to name cache folders and outputs.
    pub fn id(&self) -> String {
        volume_id(&self.image)
    }

    /// Identifier unique to the image's location on disk.
    ///
    /// Two images sharing a file name in different folders get different
    /// cache ids, so their extracted slices never alias.
    pub fn cache_id(&self) -> String {
        let location = fs::canonicalize(&self.image).unwrap_or_else(|_| self.image.clone());
        let digest = blake3::hash(location.as_os_str().as_encoded_bytes()).to_hex();
        let digest = digest.as_str();
        format!("{}_{}", self.id(), &digest[..LOCATION_DIGEST_CHARS])
    }
}

/// File name without its `.nii.gz` / `.nii` (or any single) extension.
pub fn volume_id(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    strip_volume_extension(&name).to_string()
}

fn strip_volume_extension(name: &str) -> &str {
    for ext in [".nii.gz", ".nii"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return stem;
        }
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

fn is_volume_file(name: &str) -> bool {
    name.ends_with(".nii.gz") || name.ends_with(".nii")
}

fn is_housekeeping(name: &str) -> bool {
    HOUSEKEEPING_FILES.contains(&name) || name.starts_with("._")
}

fn is_segmentation(name: &str) -> bool {
    SEGMENTATION_TOKENS.iter().any(|token| name.contains(token))
}

/// Builds the ordered catalog of image/segmentation pairs under a root folder.
pub struct DatasetIndex;

impl DatasetIndex {
    /// Walk `root` and pair every image with its segmentation.
    ///
    /// Images are visited in file-name order within each directory. An image's
    /// partner is the first segmentation file in the same directory whose name
    /// contains the image's name without extension. Images without a partner
    /// are left out of the catalog.
    ///
    /// # Errors
    ///
    /// Returns error if `root` is not a directory or cannot be read
    pub fn scan(root: impl AsRef<Path>) -> Result<Vec<VolumePair>, AugmentError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(AugmentError::MissingInputFolder(root.to_path_buf()));
        }

        let mut directories: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                AugmentError::Io(
                    err.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_housekeeping(&name) || !is_volume_file(&name) {
                continue;
            }
            let dir = entry
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            directories.entry(dir).or_default().push(name);
        }

        let mut catalog = Vec::new();
        for (dir, files) in &directories {
            for image in files.iter().filter(|name| !is_segmentation(name)) {
                let stem = strip_volume_extension(image);
                let partner = files
                    .iter()
                    .find(|other| *other != image && is_segmentation(other) && other.contains(stem));
                match partner {
                    Some(segmentation) => catalog.push(VolumePair::new(
                        dir.join(image),
                        dir.join(segmentation),
                    )),
                    None => warn!(image = %dir.join(image).display(), "no segmentation found, skipping"),
                }
            }
        }
        debug!(root = %root.display(), pairs = catalog.len(), "indexed dataset");
        Ok(catalog)
    }
}

/// Volume pairs drawn for one role, in draw order. Repeats are expected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleSet {
    pub role: Role,
    pub pairs: Vec<VolumePair>,
}

impl SampleSet {
    /// `count` copies of a single explicitly chosen pair.
    pub fn repeated(role: Role, pair: &VolumePair, count: usize) -> Self {
        Self {
            role,
            pairs: vec![pair.clone(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Uniform sampling with replacement over a catalog.
pub struct Sampler<R> {
    rng: R,
}

impl<R: Rng> Sampler<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Draw `count` pairs uniformly, with replacement.
    ///
    /// # Errors
    ///
    /// Returns [`AugmentError::EmptyCatalog`] if `count > 0` and the catalog
    /// is empty
    pub fn sample(
        &mut self,
        catalog: &[VolumePair],
        count: usize,
        role: Role,
    ) -> Result<SampleSet, AugmentError> {
        if count > 0 && catalog.is_empty() {
            return Err(AugmentError::EmptyCatalog);
        }
        let pairs = (0..count)
            .map(|_| catalog[self.rng.gen_range(0..catalog.len())].clone())
            .collect();
        Ok(SampleSet { role, pairs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::fs;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn volume_id_strips_nifti_extensions() {
        assert_eq!(volume_id(Path::new("/data/sub-01_t2.nii.gz")), "sub-01_t2");
        assert_eq!(volume_id(Path::new("sub-02_t2.nii")), "sub-02_t2");
        assert_eq!(volume_id(Path::new("notes.txt")), "notes");
    }

    #[test]
    fn cache_id_separates_same_named_images() {
        let dir = tempdir().unwrap();
        for folder in ["patient-a", "patient-b"] {
            fs::create_dir(dir.path().join(folder)).unwrap();
            touch(&dir.path().join(folder), "t2.nii.gz");
            touch(&dir.path().join(folder), "t2_seg.nii.gz");
        }
        let catalog = DatasetIndex::scan(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].id(), catalog[1].id());
        assert_ne!(catalog[0].cache_id(), catalog[1].cache_id());
        assert!(catalog[0].cache_id().starts_with("t2_"));

        let again = VolumePair::new(
            dir.path().join("patient-a").join(".").join("t2.nii.gz"),
            dir.path().join("patient-a").join("t2_seg.nii.gz"),
        );
        assert_eq!(again.cache_id(), catalog[0].cache_id());
    }

    #[test]
    fn pairs_images_with_segmentations_and_drops_orphans() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("site-b");
        fs::create_dir(&nested).unwrap();
        touch(dir.path(), "sub-01_t2.nii.gz");
        touch(dir.path(), "sub-01_t2_seg.nii.gz");
        touch(dir.path(), "sub-02_t2.nii.gz");
        touch(dir.path(), ".DS_Store");
        touch(dir.path(), "readme.txt");
        touch(&nested, "sub-03_t2s.nii.gz");
        touch(&nested, "sub-03_t2s_gmseg.nii.gz");

        let catalog = DatasetIndex::scan(dir.path()).unwrap();

        assert_eq!(
            catalog,
            vec![
                VolumePair::new(
                    dir.path().join("sub-01_t2.nii.gz"),
                    dir.path().join("sub-01_t2_seg.nii.gz"),
                ),
                VolumePair::new(
                    nested.join("sub-03_t2s.nii.gz"),
                    nested.join("sub-03_t2s_gmseg.nii.gz"),
                ),
            ]
        );
    }

    #[test]
    fn first_matching_segmentation_wins() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.nii.gz");
        touch(dir.path(), "a_gmseg.nii.gz");
        touch(dir.path(), "a_seg.nii.gz");

        let catalog = DatasetIndex::scan(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].segmentation, dir.path().join("a_gmseg.nii.gz"));
    }

    #[test]
    fn empty_folder_gives_empty_catalog_and_missing_folder_errors() {
        let dir = tempdir().unwrap();
        assert!(DatasetIndex::scan(dir.path()).unwrap().is_empty());
        assert!(matches!(
            DatasetIndex::scan(dir.path().join("absent")),
            Err(AugmentError::MissingInputFolder(_))
        ));
    }

    #[test]
    fn sampling_is_with_replacement_and_reproducible() {
        let catalog = vec![VolumePair::new("a.nii.gz", "a_seg.nii.gz")];
        let mut sampler = Sampler::new(ChaCha8Rng::seed_from_u64(7));
        let set = sampler.sample(&catalog, 5, Role::Target).unwrap();
        assert_eq!(set.len(), 5);
        assert!(set.pairs.iter().all(|pair| pair == &catalog[0]));

        let catalog: Vec<_> = (0..6)
            .map(|i| VolumePair::new(format!("v{i}.nii.gz"), format!("v{i}_seg.nii.gz")))
            .collect();
        let first = Sampler::new(ChaCha8Rng::seed_from_u64(42))
            .sample(&catalog, 20, Role::Source)
            .unwrap();
        let second = Sampler::new(ChaCha8Rng::seed_from_u64(42))
            .sample(&catalog, 20, Role::Source)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sampling_an_empty_catalog_fails_unless_nothing_is_requested() {
        let mut sampler = Sampler::new(ChaCha8Rng::seed_from_u64(1));
        assert!(sampler.sample(&[], 0, Role::Source).unwrap().is_empty());
        assert!(matches!(
            sampler.sample(&[], 1, Role::Source),
            Err(AugmentError::EmptyCatalog)
        ));
    }
}
