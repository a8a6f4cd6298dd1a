use crate::enums::Stage;
use crate::tools::ToolError;
use crate::volume_loader::VolumeLoaderError;

use std::path::PathBuf;
use thiserror::Error;

/// Exit status for cancelled runs and runs where any task failed.
pub const EXIT_RUN_ABORTED: u8 = 2;

/// Exit status for invalid input detected before any parallel work starts.
pub const EXIT_INVALID_INPUT: u8 = 1;

#[derive(Debug, Error)]
pub enum AugmentError {
    #[error("Input folder {0} does not exist")]
    MissingInputFolder(PathBuf),

    #[error("No segmentation found for {0}")]
    MissingSegmentation(PathBuf),

    #[error("Dataset catalog is empty, nothing to sample from")]
    EmptyCatalog,

    #[error("Slice index {index} is outside [0, {depth}) for {path}")]
    SliceIndexOutOfBounds {
        path: PathBuf,
        index: usize,
        depth: usize,
    },

    #[error("{path} has depth {depth}, at least 3 slices are needed")]
    NoUsableSlices { path: PathBuf, depth: usize },

    #[error("Slice of {path} is {actual:?}, smaller than the requested {requested:?}")]
    SliceTooSmall {
        path: PathBuf,
        actual: (usize, usize),
        requested: (usize, usize),
    },

    #[error("Image {image} and segmentation {segmentation} have different shapes")]
    GeometryMismatch {
        image: PathBuf,
        segmentation: PathBuf,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Volume(#[from] VolumeLoaderError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("Failed to write preview image: {0}")]
    Preview(#[from] image::ImageError),

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Run cancelled during the {stage} stage")]
    Cancelled { stage: Stage },

    #[error("{stage} task {index} failed: {source}")]
    Task {
        stage: Stage,
        index: usize,
        #[source]
        source: Box<AugmentError>,
    },
}

impl AugmentError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            AugmentError::Cancelled { .. } | AugmentError::Task { .. } => EXIT_RUN_ABORTED,
            AugmentError::Tool(_) | AugmentError::Panicked(_) => EXIT_RUN_ABORTED,
            _ => EXIT_INVALID_INPUT,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AugmentError::Cancelled { .. })
    }
}
