//! Three-letter axis orientation codes.
//!
//! Letters name the side each voxel axis starts *from*, so `RPI` means the
//! first axis runs right to left, the second posterior to anterior and the
//! third inferior to superior. World coordinates follow the NIfTI RAS+
//! convention.

use crate::volume::{Affine, Volume};

use ndarray::Axis;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid orientation code {0:?}; expected one letter from each of RL, AP, IS")]
pub struct InvalidAxisCodes(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AxisCodes([u8; 3]);

impl AxisCodes {
    /// Canonical ordering every volume is normalised to.
    pub const RPI: AxisCodes = AxisCodes(*b"RPI");

    /// World axis and direction sign a letter stands for.
    fn world_axis(letter: u8) -> (usize, f32) {
        match letter {
            b'L' => (0, 1.0),
            b'R' => (0, -1.0),
            b'P' => (1, 1.0),
            b'A' => (1, -1.0),
            b'I' => (2, 1.0),
            _ => (2, -1.0),
        }
    }

    fn letter(world_axis: usize, sign: f32) -> u8 {
        match (world_axis, sign >= 0.0) {
            (0, true) => b'L',
            (0, false) => b'R',
            (1, true) => b'P',
            (1, false) => b'A',
            (_, true) => b'I',
            (_, false) => b'S',
        }
    }

    /// Nearest orientation code for the rotation part of `affine`.
    pub fn from_affine(affine: &Affine) -> Self {
        let mut used = [false; 3];
        let mut letters = [b'?'; 3];
        // Assign the most dominant column first so oblique volumes still get three distinct axes
        let mut columns: Vec<(usize, usize, f32)> = (0..3)
            .flat_map(|c| (0..3).map(move |r| (c, r, affine[r][c])))
            .collect();
        columns.sort_by(|a, b| b.2.abs().total_cmp(&a.2.abs()));

        let mut assigned = [false; 3];
        for (column, row, value) in columns {
            if assigned[column] || used[row] {
                continue;
            }
            letters[column] = Self::letter(row, value);
            assigned[column] = true;
            used[row] = true;
        }
        AxisCodes(letters)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("???")
    }

    /// Axis permutation and flips that take a volume from `self` to `target`.
    ///
    /// `perm[t]` is the source axis that becomes target axis `t`.
    pub fn transform_to(&self, target: AxisCodes) -> ([usize; 3], [bool; 3]) {
        let mut perm = [0usize; 3];
        let mut flip = [false; 3];
        for t in 0..3 {
            let (world, sign) = Self::world_axis(target.0[t]);
            for s in 0..3 {
                let (src_world, src_sign) = Self::world_axis(self.0[s]);
                if src_world == world {
                    perm[t] = s;
                    flip[t] = src_sign != sign;
                }
            }
        }
        (perm, flip)
    }
}

impl fmt::Display for AxisCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AxisCodes {
    type Err = InvalidAxisCodes;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let bytes: [u8; 3] = upper
            .as_bytes()
            .try_into()
            .map_err(|_| InvalidAxisCodes(s.to_string()))?;
        let mut seen = [false; 3];
        for &b in &bytes {
            if !b"LRPAIS".contains(&b) {
                return Err(InvalidAxisCodes(s.to_string()));
            }
            let (world, _) = Self::world_axis(b);
            if seen[world] {
                return Err(InvalidAxisCodes(s.to_string()));
            }
            seen[world] = true;
        }
        Ok(AxisCodes(bytes))
    }
}

/// Reorder and flip the voxel axes of `volume` so that it reads as `target`.
///
/// World geometry is preserved: every voxel keeps its world position.
pub fn reorient(volume: &Volume, target: AxisCodes) -> Volume {
    let current = volume.orientation();
    if current == target {
        return volume.clone();
    }
    let (perm, flip) = current.transform_to(target);
    let dims = volume.data.shape().to_vec();

    let mut data = volume.data.clone().permuted_axes(perm);
    for (t, &flipped) in flip.iter().enumerate() {
        if flipped {
            data.invert_axis(Axis(t));
        }
    }
    let data = data.as_standard_layout().into_owned();

    let old = &volume.affine;
    let mut affine: Affine = [[0.0; 4]; 3];
    for row in 0..3 {
        affine[row][3] = old[row][3];
    }
    for t in 0..3 {
        let s = perm[t];
        let sign = if flip[t] { -1.0 } else { 1.0 };
        for row in 0..3 {
            affine[row][t] = old[row][s] * sign;
            if flip[t] {
                affine[row][3] += old[row][s] * (dims[s] as f32 - 1.0);
            }
        }
    }
    let spacing = [volume.spacing.0, volume.spacing.1, volume.spacing.2];

    Volume {
        data,
        spacing: (spacing[perm[0]], spacing[perm[1]], spacing[perm[2]]),
        affine,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn derives_codes_from_affine() {
        let rpi = [[-1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        assert_eq!(AxisCodes::from_affine(&rpi), AxisCodes::RPI);

        let ras_storage = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        assert_eq!(AxisCodes::from_affine(&ras_storage).as_str(), "LPI");

        let swapped = [[0.0, 0.0, -2.0, 0.0], [0.0, -1.0, 0.0, 0.0], [0.5, 0.0, 0.0, 0.0]];
        assert_eq!(AxisCodes::from_affine(&swapped).as_str(), "IAR");
    }

    #[test]
    fn parses_only_complete_codes() {
        assert_eq!("rpi".parse::<AxisCodes>().unwrap(), AxisCodes::RPI);
        assert!("RRI".parse::<AxisCodes>().is_err());
        assert!("RP".parse::<AxisCodes>().is_err());
        assert!("RPX".parse::<AxisCodes>().is_err());
    }

    #[test]
    fn reorient_preserves_world_positions() {
        let data = Array3::from_shape_fn((3, 4, 5), |(x, y, z)| (x * 100 + y * 10 + z) as f32);
        let affine = [[0.0, 0.0, -2.0, 5.0], [0.0, -1.0, 0.0, 1.0], [3.0, 0.0, 0.0, -4.0]];
        let volume = Volume::with_affine(data, affine);
        assert_ne!(volume.orientation(), AxisCodes::RPI);

        let canonical = reorient(&volume, AxisCodes::RPI);
        assert_eq!(canonical.orientation(), AxisCodes::RPI);
        assert_eq!(canonical.spacing, (2.0, 1.0, 3.0));

        for ((i, j, k), &value) in canonical.data.indexed_iter() {
            let world = canonical.voxel_to_world([i as f32, j as f32, k as f32]);
            let x = (value as usize) / 100;
            let y = (value as usize / 10) % 10;
            let z = value as usize % 10;
            assert_eq!(world, volume.voxel_to_world([x as f32, y as f32, z as f32]));
        }
    }
}
