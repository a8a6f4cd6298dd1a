use crate::dataset::VolumePair;
use crate::enums::Role;
use crate::error::AugmentError;

use std::path::PathBuf;

/// Pairs that replace random sampling for a role.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleOverrides {
    pub source: Option<VolumePair>,
    pub destination: Option<VolumePair>,
    pub target: Option<VolumePair>,
}

impl RoleOverrides {
    pub fn get(&self, role: Role) -> Option<&VolumePair> {
        match role {
            Role::Source => self.source.as_ref(),
            Role::Destination => self.destination.as_ref(),
            Role::Target => self.target.as_ref(),
        }
    }

    pub fn covers_all_roles(&self) -> bool {
        self.source.is_some() && self.destination.is_some() && self.target.is_some()
    }
}

/// Settings for one augmentation run. Built once and never mutated.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub input_folder: Option<PathBuf>,
    pub overrides: RoleOverrides,
    /// Crop size `(x, y)` of every extracted slice.
    pub output_size: (usize, usize),
    /// Target slices warped by each field.
    pub slice_count: usize,
    /// Source/destination pairs, one field each.
    pub wrap_count: usize,
    pub output_folder: PathBuf,
    /// Parent of the `Slices_<id>` cache folders.
    pub cache_root: PathBuf,
    /// Where transient deformation fields are written.
    pub work_dir: PathBuf,
    /// 0 runs every task serially on the calling thread.
    pub workers: usize,
    pub pre_slice_all: bool,
    pub center_on_segmentation: bool,
    pub previews: bool,
    /// 0 quiet, 1 normal, 2 also echoes external tool output.
    pub verbosity: u8,
    pub seed: Option<u64>,
}

impl RunConfig {
    pub fn new(output_size: (usize, usize), slice_count: usize, wrap_count: usize) -> Self {
        Self {
            input_folder: None,
            overrides: RoleOverrides::default(),
            output_size,
            slice_count,
            wrap_count,
            output_folder: PathBuf::from("."),
            cache_root: PathBuf::from("."),
            work_dir: PathBuf::from("."),
            workers: 0,
            pre_slice_all: false,
            center_on_segmentation: false,
            previews: false,
            verbosity: 1,
            seed: None,
        }
    }

    pub fn target_count(&self) -> usize {
        self.wrap_count * self.slice_count
    }

    /// # Errors
    ///
    /// Returns error on zero sizes or counts, or when a role has neither an
    /// override nor an input folder to sample from
    pub fn validate(&self) -> Result<(), AugmentError> {
        let (x, y) = self.output_size;
        if x == 0 || y == 0 {
            return Err(AugmentError::InvalidConfig(format!(
                "output size must be positive, got {x}x{y}"
            )));
        }
        if self.slice_count == 0 || self.wrap_count == 0 {
            return Err(AugmentError::InvalidConfig(
                "slice and wrap counts must be positive".to_string(),
            ));
        }
        match &self.input_folder {
            Some(folder) if !folder.is_dir() => {
                Err(AugmentError::MissingInputFolder(folder.clone()))
            }
            None if !self.overrides.covers_all_roles() => Err(AugmentError::InvalidConfig(
                "an input folder is required unless source, destination and target are all given"
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_degenerate_sizes_and_counts() {
        let dir = tempdir().unwrap();
        let mut config = RunConfig::new((0, 40), 3, 2);
        config.input_folder = Some(dir.path().to_path_buf());
        assert!(config.validate().is_err());

        config.output_size = (40, 40);
        config.wrap_count = 0;
        assert!(config.validate().is_err());

        config.wrap_count = 2;
        assert!(config.validate().is_ok());
        assert_eq!(config.target_count(), 6);
    }

    #[test]
    fn input_folder_needed_unless_every_role_is_overridden() {
        let mut config = RunConfig::new((8, 8), 1, 1);
        assert!(matches!(config.validate(), Err(AugmentError::InvalidConfig(_))));

        config.input_folder = Some(PathBuf::from("/definitely/not/here"));
        assert!(matches!(
            config.validate(),
            Err(AugmentError::MissingInputFolder(_))
        ));

        let pair = VolumePair::new("a.nii.gz", "a_seg.nii.gz");
        config.input_folder = None;
        config.overrides = RoleOverrides {
            source: Some(pair.clone()),
            destination: Some(pair.clone()),
            target: Some(pair),
        };
        assert!(config.validate().is_ok());
        assert!(config.overrides.get(Role::Target).is_some());
    }
}
