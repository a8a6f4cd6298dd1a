//! Resampling target slices through a deformation field.

use crate::enums::Interpolation;
use crate::error::AugmentError;
use crate::extractor::ExtractedSlice;
use crate::registration::DeformationField;
use crate::tools::{CancelToken, ExternalTool, ToolError, ToolRunner};
use crate::volume_loader::VolumeLoader;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_APPLY_BIN: &str = "isct_antsApplyTransforms";

/// Longest identifier kept in an output file name.
pub const MAX_ID_CHARS: usize = 24;

#[derive(Clone, Copy, Debug)]
pub struct ApplyRequest<'a> {
    pub input: &'a Path,
    /// Image whose grid the output is resampled onto.
    pub reference: &'a Path,
    pub field: &'a Path,
    pub output: &'a Path,
    pub interpolation: Interpolation,
}

impl ApplyRequest<'_> {
    pub fn ants_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-d", "2", "-i"].map(OsString::from).to_vec();
        args.push(self.input.into());
        args.push("-r".into());
        args.push(self.reference.into());
        args.push("-n".into());
        args.push(self.interpolation.ants_name().into());
        args.push("-t".into());
        args.push(self.field.into());
        args.push("--output".into());
        args.push(self.output.into());
        args
    }
}

/// External collaborator resampling an image through a warp field.
pub trait FieldApplicationService: Send + Sync {
    /// Name used when reporting this service's failures.
    fn name(&self) -> String {
        "field application".to_string()
    }

    fn apply(&self, request: &ApplyRequest<'_>, cancel: &CancelToken) -> Result<(), ToolError>;
}

/// `isct_antsApplyTransforms` launched as a child process.
#[derive(Clone, Debug)]
pub struct AntsApplyTransforms {
    runner: ToolRunner,
}

impl AntsApplyTransforms {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

impl Default for AntsApplyTransforms {
    fn default() -> Self {
        Self::new(ToolRunner::new(DEFAULT_APPLY_BIN))
    }
}

impl FieldApplicationService for AntsApplyTransforms {
    fn name(&self) -> String {
        self.runner.name()
    }

    fn apply(&self, request: &ApplyRequest<'_>, cancel: &CancelToken) -> Result<(), ToolError> {
        self.runner.run(request.ants_args(), cancel)
    }
}

impl ExternalTool for AntsApplyTransforms {
    fn key(&self) -> &'static str {
        "apply-transforms"
    }

    fn describe(&self) -> String {
        format!("{} (nearest neighbour, 2D)", self.runner.program().display())
    }

    fn probe(&self) -> Result<(), ToolError> {
        self.runner.probe()
    }
}

fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(MAX_ID_CHARS) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Identity fields an augmented sample is named from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AugmentedName<'a> {
    pub source: (&'a str, usize),
    pub destination: (&'a str, usize),
    pub target: (&'a str, usize),
    pub wrap: usize,
    pub slot: usize,
}

impl<'a> AugmentedName<'a> {
    pub fn new(
        source: &'a ExtractedSlice,
        destination: &'a ExtractedSlice,
        target: &'a ExtractedSlice,
        wrap: usize,
        slot: usize,
    ) -> Self {
        Self {
            source: (&source.volume_id, source.index),
            destination: (&destination.volume_id, destination.index),
            target: (&target.volume_id, target.index),
            wrap,
            slot,
        }
    }

    /// `<src><n>_<dst><n>_<tgt><n>_<wrap>-<slot>`
    pub fn stem(&self) -> String {
        let part = |(id, index): (&str, usize)| format!("{}{index}", truncate_id(id));
        format!(
            "{}_{}_{}_{}-{}",
            part(self.source),
            part(self.destination),
            part(self.target),
            self.wrap,
            self.slot
        )
    }

    pub fn image_file_name(&self) -> String {
        format!("{}.nii.gz", self.stem())
    }

    pub fn segmentation_file_name(&self) -> String {
        format!("{}_seg.nii.gz", self.stem())
    }

    pub fn preview_file_name(&self) -> String {
        format!("{}.png", self.stem())
    }
}

/// A synthetic image/segmentation pair written to the output folder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AugmentedSample {
    pub image: PathBuf,
    pub segmentation: PathBuf,
}

pub struct FieldApplicator {
    service: Arc<dyn FieldApplicationService>,
    output_folder: PathBuf,
    previews: bool,
}

impl FieldApplicator {
    pub fn new(service: Arc<dyn FieldApplicationService>, output_folder: impl Into<PathBuf>) -> Self {
        Self {
            service,
            output_folder: output_folder.into(),
            previews: false,
        }
    }

    /// Also write a PNG rendering of every augmented image.
    pub fn with_previews(mut self, previews: bool) -> Self {
        self.previews = previews;
        self
    }

    /// Warp `target` through `field` onto the destination slice's grid.
    ///
    /// Image and segmentation both use nearest-neighbour interpolation.
    pub fn apply(
        &self,
        target: &ExtractedSlice,
        field: &DeformationField,
        slot: usize,
        cancel: &CancelToken,
    ) -> Result<AugmentedSample, AugmentError> {
        let name = AugmentedName::new(&field.source, &field.destination, target, field.pair_index, slot);
        let sample = AugmentedSample {
            image: self.output_folder.join(name.image_file_name()),
            segmentation: self.output_folder.join(name.segmentation_file_name()),
        };

        for (input, output) in [
            (&target.image, &sample.image),
            (&target.segmentation, &sample.segmentation),
        ] {
            let request = ApplyRequest {
                input,
                reference: &field.destination.image,
                field: field.path(),
                output,
                interpolation: Interpolation::NearestNeighbor,
            };
            self.service.apply(&request, cancel)?;
            if !output.is_file() {
                return Err(ToolError::MissingOutput {
                    tool: self.service.name(),
                    path: output.clone(),
                }
                .into());
            }
        }

        if self.previews {
            let volume = VolumeLoader::load(&sample.image)?;
            if let Some(image) = volume.to_image() {
                image.save(self.output_folder.join(name.preview_file_name()))?;
            }
        }
        debug!(output = %sample.image.display(), "augmented sample written");
        Ok(sample)
    }
}
