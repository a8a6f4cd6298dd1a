use crate::volume::{Affine, Volume};

use ndarray::{Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("Unsupported volume shape {shape:?} in {path}")]
    UnsupportedShape { path: PathBuf, shape: Vec<usize> },

    #[error("NIfTI error in {path}: {source}")]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Millimetre code for `xyzt_units`.
const UNITS_MM: u8 = 2;

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a NIfTI volume (`.nii` or `.nii.gz`)
    ///
    /// 2D images load with a depth of one and 4D images with a single
    /// time point drop their time axis.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be decoded or holds more than one
    /// time point
    pub fn load(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|source| Self::nifti_error(path, source))?;
        let header = object.header().clone();
        let data = object
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|source| Self::nifti_error(path, source))?;

        let shape = data.shape().to_vec();
        let data = match shape.len() {
            2 => data.insert_axis(Axis(2)).into_dimensionality::<Ix3>(),
            3 => data.into_dimensionality::<Ix3>(),
            4 if shape[3] == 1 => data.index_axis_move(Axis(3), 0).into_dimensionality::<Ix3>(),
            _ => {
                return Err(VolumeLoaderError::UnsupportedShape {
                    path: path.to_path_buf(),
                    shape,
                });
            }
        }
        .map_err(|_| VolumeLoaderError::UnsupportedShape {
            path: path.to_path_buf(),
            shape: shape.clone(),
        })?;

        let spacing = (
            header.pixdim[1].abs(),
            header.pixdim[2].abs(),
            Self::third_spacing(&header),
        );

        Ok(Volume {
            data,
            spacing,
            affine: Self::get_affine(&header),
        })
    }

    /// Read only the header and return `(nx, ny, nz)`.
    pub fn load_dimensions(path: impl AsRef<Path>) -> Result<(usize, usize, usize), VolumeLoaderError> {
        let path = path.as_ref();
        let header =
            NiftiHeader::from_file(path).map_err(|source| Self::nifti_error(path, source))?;
        let extent = |i: usize| {
            if usize::from(header.dim[0]) >= i {
                usize::from(header.dim[i]).max(1)
            } else {
                1
            }
        };
        Ok((extent(1), extent(2), extent(3)))
    }

    /// Write `volume` to `path`, replacing any existing file atomically.
    ///
    /// The data is written to a hidden sibling file first and renamed into
    /// place, so concurrent readers see either the old file or the complete
    /// new one.
    pub fn save(volume: &Volume, path: impl AsRef<Path>) -> Result<(), VolumeLoaderError> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let suffix = if Self::is_gzipped(path) { ".nii.gz" } else { ".nii" };
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(suffix)
            .tempfile_in(parent)?;

        let header = Self::build_header(volume);
        WriterOptions::new(staging.path())
            .reference_header(&header)
            .write_nifti(&volume.data)
            .map_err(|source| Self::nifti_error(path, source))?;

        staging
            .persist(path)
            .map_err(|err| VolumeLoaderError::Publish {
                path: path.to_path_buf(),
                source: err.error,
            })?;
        Ok(())
    }

    fn is_gzipped(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
    }

    fn nifti_error(path: &Path, source: nifti::NiftiError) -> VolumeLoaderError {
        VolumeLoaderError::Nifti {
            path: path.to_path_buf(),
            source,
        }
    }

    fn third_spacing(header: &NiftiHeader) -> f32 {
        let spacing = header.pixdim[3].abs();
        if header.dim[0] < 3 || spacing == 0.0 {
            1.0
        } else {
            spacing
        }
    }

    fn build_header(volume: &Volume) -> NiftiHeader {
        let (sx, sy, sz) = volume.spacing;
        NiftiHeader {
            pixdim: [1.0, sx, sy, sz, 1.0, 1.0, 1.0, 1.0],
            sform_code: 1,
            qform_code: 0,
            srow_x: volume.affine[0],
            srow_y: volume.affine[1],
            srow_z: volume.affine[2],
            xyzt_units: UNITS_MM,
            ..NiftiHeader::default()
        }
    }

    // sform first, then qform, then plain pixdim scaling
    fn get_affine(header: &NiftiHeader) -> Affine {
        if header.sform_code > 0 {
            return [header.srow_x, header.srow_y, header.srow_z];
        }
        if header.qform_code > 0 {
            return Self::qform_to_affine(header);
        }
        [
            [header.pixdim[1], 0.0, 0.0, 0.0],
            [0.0, header.pixdim[2], 0.0, 0.0],
            [0.0, 0.0, Self::third_spacing(header), 0.0],
        ]
    }

    #[allow(clippy::many_single_char_names)]
    fn qform_to_affine(header: &NiftiHeader) -> Affine {
        let (b, c, d) = (header.quatern_b, header.quatern_c, header.quatern_d);
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();

        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (i, j, k) = (
            header.pixdim[1].abs(),
            header.pixdim[2].abs(),
            Self::third_spacing(header) * qfac,
        );

        [
            [
                (a * a + b * b - c * c - d * d) * i,
                2.0 * (b * c - a * d) * j,
                2.0 * (b * d + a * c) * k,
                header.quatern_x,
            ],
            [
                2.0 * (b * c + a * d) * i,
                (a * a - b * b + c * c - d * d) * j,
                2.0 * (c * d - a * b) * k,
                header.quatern_y,
            ],
            [
                2.0 * (b * d - a * c) * i,
                2.0 * (c * d + a * b) * j,
                (a * a - b * b - c * c + d * d) * k,
                header.quatern_z,
            ],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orientation::AxisCodes;
    use ndarray::Array3;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_keeps_data_and_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volume.nii.gz");
        let data = Array3::from_shape_fn((5, 4, 3), |(x, y, z)| (x + 5 * y + 20 * z) as f32);
        let affine = [[-1.0, 0.0, 0.0, 4.0], [0.0, 1.0, 0.0, -2.0], [0.0, 0.0, 2.0, 7.0]];
        let volume = Volume::with_affine(data.clone(), affine);

        VolumeLoader::save(&volume, &path).unwrap();
        let loaded = VolumeLoader::load(&path).unwrap();

        assert_eq!(loaded.data, data);
        assert_eq!(loaded.affine, affine);
        assert_eq!(loaded.spacing, (1.0, 1.0, 2.0));
        assert_eq!(loaded.orientation(), AxisCodes::RPI);
        assert_eq!(VolumeLoader::load_dimensions(&path).unwrap(), (5, 4, 3));
    }

    #[test]
    fn save_leaves_no_staging_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("slice.nii.gz");
        let volume = Volume::new(Array3::zeros((3, 3, 1)), (1.0, 1.0, 1.0));

        VolumeLoader::save(&volume, &path).unwrap();
        VolumeLoader::save(&volume, &path).unwrap();

        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("slice.nii.gz")]);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.nii.gz");
        let err = VolumeLoader::load(&path).unwrap_err();
        assert!(err.to_string().contains("absent.nii.gz"));
    }
}
