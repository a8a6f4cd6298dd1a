//! # slice-augment library
//!
//! This crate synthesises new training pairs for 2D segmentation models from
//! a folder of 3D NIfTI volumes and their segmentations.
//!
//! A run draws three pools of volumes with replacement: sources,
//! destinations and targets. One random axial slice is extracted from each
//! sampled volume, a deformation field is registered from every source
//! segmentation onto its destination segmentation, and every field is then
//! applied to a group of target slices. Each warped target is written as a
//! new image/segmentation pair.
//!
//! Volumes are normalised once before slicing:
//!  - Resampled to 1 mm isotropic voxels (nearest neighbour)
//!  - Reoriented to the canonical `RPI` axis ordering
//!
//! Extracted slices are cached on disk per volume and slice index, so
//! repeated runs over the same dataset reuse earlier crops. Registration and
//! field application are delegated to the ANTs command-line tools through
//! the [`RegistrationService`] and [`FieldApplicationService`] traits; the
//! intermediate deformation fields are deleted when a run ends.
//!
//! Work inside each stage runs on a rayon thread pool when more than zero
//! workers are configured. A shared [`CancelToken`] stops a run between
//! tasks and kills external tools that are still running.
//!
//! # Examples
//!
//! ## Augmenting a dataset
//!
//! Produce 3 deformation fields, each applied to 10 target slices cropped to
//! 64x64 voxels.
//!
//! ```no_run
//! # use slice_augment::{CancelToken, Pipeline, RunConfig, Services};
//! # use std::path::PathBuf;
//! let mut config = RunConfig::new((64, 64), 10, 3);
//! config.input_folder = Some(PathBuf::from("dataset"));
//! config.output_folder = PathBuf::from("augmented");
//! config.workers = 4;
//!
//! let services = Services::ants("isct_antsRegistration", "isct_antsApplyTransforms", false);
//! let report = Pipeline::new(config, services, CancelToken::new())
//!     .run()
//!     .expect("should have augmented the dataset");
//! println!("{} samples written", report.samples.len());
//! ```

pub mod apply;
pub mod config;
pub mod dataset;
pub mod enums;
pub mod error;
pub mod extractor;
mod interpolator;
pub mod orientation;
pub mod pipeline;
pub mod preprocess;
pub mod registration;
pub mod slice_cache;
pub mod tools;
pub mod volume;
pub mod volume_loader;

pub use apply::{FieldApplicationService, FieldApplicator};
pub use config::{RoleOverrides, RunConfig};
pub use dataset::{DatasetIndex, Sampler, VolumePair};
pub use error::AugmentError;
pub use pipeline::{Pipeline, RunReport, Services};
pub use registration::{RegistrationEngine, RegistrationService};
pub use tools::CancelToken;
