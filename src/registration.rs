//! Pairwise deformation fields between source and destination segmentations.

use crate::enums::Interpolation;
use crate::error::AugmentError;
use crate::extractor::ExtractedSlice;
use crate::tools::{CancelToken, ExternalTool, ToolError, ToolRunner};

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_REGISTRATION_BIN: &str = "isct_antsRegistration";

/// Fixed parameter set handed to the registration tool.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationProfile {
    pub dimensionality: u8,
    /// B-spline SyN mesh size at base level, update field and total field parameters.
    pub bspline_syn: (f32, f32, f32),
    pub metric_weight: f32,
    pub convergence: Vec<u32>,
    pub shrink_factors: Vec<u32>,
    pub smoothing_sigmas_mm: Vec<u32>,
    pub preview_interpolation: Interpolation,
}

impl Default for RegistrationProfile {
    fn default() -> Self {
        Self {
            dimensionality: 2,
            bspline_syn: (0.5, 1.0, 3.0),
            metric_weight: 1.0,
            convergence: vec![5, 3],
            shrink_factors: vec![2, 1],
            smoothing_sigmas_mm: vec![1, 0],
            preview_interpolation: Interpolation::BSpline(3),
        }
    }
}

fn join_levels(levels: &[u32]) -> String {
    levels
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join("x")
}

impl RegistrationProfile {
    /// Command line for `isct_antsRegistration`.
    pub fn ants_args(&self, request: &RegistrationRequest<'_>) -> Vec<OsString> {
        let (mesh, update, total) = self.bspline_syn;
        let args = [
            "--dimensionality".to_string(),
            self.dimensionality.to_string(),
            "--transform".to_string(),
            format!("BSplineSyN[{mesh},{update},{total}]"),
            "--metric".to_string(),
            format!(
                "MeanSquares[{},{},{}]",
                request.fixed.display(),
                request.moving.display(),
                self.metric_weight
            ),
            "--convergence".to_string(),
            join_levels(&self.convergence),
            "--shrink-factors".to_string(),
            join_levels(&self.shrink_factors),
            "--smoothing-sigmas".to_string(),
            format!("{}mm", join_levels(&self.smoothing_sigmas_mm)),
            "--output".to_string(),
            format!(
                "[{},{}]",
                request.output_prefix.display(),
                request.warped_preview.display()
            ),
            "--interpolation".to_string(),
            self.preview_interpolation.ants_name(),
            "--verbose".to_string(),
            "0".to_string(),
        ];
        args.into_iter().map(OsString::from).collect()
    }
}

/// One registration job: warp `moving` onto `fixed`.
#[derive(Clone, Copy, Debug)]
pub struct RegistrationRequest<'a> {
    /// Destination segmentation.
    pub fixed: &'a Path,
    /// Source segmentation.
    pub moving: &'a Path,
    pub output_prefix: &'a Path,
    pub warped_preview: &'a Path,
    pub profile: &'a RegistrationProfile,
}

/// External collaborator computing a 2D deformation field.
pub trait RegistrationService: Send + Sync {
    /// Name used when reporting this service's failures.
    fn name(&self) -> String {
        "registration".to_string()
    }

    /// Write `<output_prefix>0Warp.nii.gz` (and companions) for `request`.
    fn register(&self, request: &RegistrationRequest<'_>, cancel: &CancelToken)
    -> Result<(), ToolError>;
}

/// `isct_antsRegistration` launched as a child process.
#[derive(Clone, Debug)]
pub struct AntsRegistration {
    runner: ToolRunner,
}

impl AntsRegistration {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }
}

impl Default for AntsRegistration {
    fn default() -> Self {
        Self::new(ToolRunner::new(DEFAULT_REGISTRATION_BIN))
    }
}

impl RegistrationService for AntsRegistration {
    fn name(&self) -> String {
        self.runner.name()
    }

    fn register(
        &self,
        request: &RegistrationRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<(), ToolError> {
        self.runner.run(request.profile.ants_args(request), cancel)
    }
}

impl ExternalTool for AntsRegistration {
    fn key(&self) -> &'static str {
        "registration"
    }

    fn describe(&self) -> String {
        format!("{} (B-spline SyN, 2D)", self.runner.program().display())
    }

    fn probe(&self) -> Result<(), ToolError> {
        self.runner.probe()
    }
}

/// Files written by one registration, all of them transient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldArtifacts {
    pub prefix: PathBuf,
    pub warp: PathBuf,
    pub inverse_warp: PathBuf,
    pub warped_preview: PathBuf,
}

impl FieldArtifacts {
    /// Deterministic locations for wrap `pair_index` under `work_dir`.
    pub fn for_pair(work_dir: &Path, pair_index: usize) -> Self {
        Self {
            prefix: work_dir.join(pair_index.to_string()),
            warp: work_dir.join(format!("{pair_index}0Warp.nii.gz")),
            inverse_warp: work_dir.join(format!("{pair_index}0InverseWarp.nii.gz")),
            warped_preview: work_dir.join(format!("{pair_index}_warped.nii.gz")),
        }
    }

    pub fn paths(&self) -> [&Path; 3] {
        [&self.warp, &self.inverse_warp, &self.warped_preview]
    }

    /// Delete whichever artifacts exist. Returns whether the warp itself existed.
    pub fn remove(&self) -> bool {
        let existed = self.warp.is_file();
        for path in self.paths() {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), %err, "could not remove field artifact");
                }
            }
        }
        existed
    }
}

/// Forward warp from a source segmentation slice to a destination one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeformationField {
    pub pair_index: usize,
    pub source: ExtractedSlice,
    pub destination: ExtractedSlice,
    pub artifacts: FieldArtifacts,
}

impl DeformationField {
    pub fn path(&self) -> &Path {
        &self.artifacts.warp
    }
}

pub struct RegistrationEngine {
    service: Arc<dyn RegistrationService>,
    profile: RegistrationProfile,
    work_dir: PathBuf,
}

impl RegistrationEngine {
    pub fn new(service: Arc<dyn RegistrationService>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            profile: RegistrationProfile::default(),
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn artifacts(&self, pair_index: usize) -> FieldArtifacts {
        FieldArtifacts::for_pair(&self.work_dir, pair_index)
    }

    /// Compute the field for wrap `pair_index`. Failures are not retried.
    pub fn register(
        &self,
        source: &ExtractedSlice,
        destination: &ExtractedSlice,
        pair_index: usize,
        cancel: &CancelToken,
    ) -> Result<DeformationField, AugmentError> {
        if source.volume_id == destination.volume_id && source.index == destination.index {
            // Sampling with replacement makes this legal; it yields a near-identity field
            debug!(pair_index, volume = %source.volume_id, "source and destination slices coincide");
        }
        let artifacts = self.artifacts(pair_index);
        let request = RegistrationRequest {
            fixed: &destination.segmentation,
            moving: &source.segmentation,
            output_prefix: &artifacts.prefix,
            warped_preview: &artifacts.warped_preview,
            profile: &self.profile,
        };
        self.service.register(&request, cancel)?;

        if !artifacts.warp.is_file() {
            return Err(ToolError::MissingOutput {
                tool: self.service.name(),
                path: artifacts.warp,
            }
            .into());
        }
        debug!(pair_index, field = %artifacts.warp.display(), "registered");
        Ok(DeformationField {
            pair_index,
            source: source.clone(),
            destination: destination.clone(),
            artifacts,
        })
    }
}
