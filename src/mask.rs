use crate::error::{MetaError, Result};

/// Voxel → world (mm) transform stored as the top three rows of a 4x4 affine.
#[derive(Debug, Clone, PartialEq)]
pub struct Affine {
    matrix: [[f64; 4]; 3],
    inverse: [[f64; 4]; 3],
}
impl Affine {
    pub fn new(matrix: [[f64; 4]; 3]) -> Result<Self> {
        let inverse = invert(&matrix).ok_or_else(|| {
            MetaError::input("mask", "voxel-to-world affine is singular or non-finite")
        })?;
        Ok(Self { matrix, inverse })
    }

    /// Axis-aligned affine with isotropic voxels and the given origin.
    pub fn isotropic(voxel_size: f64, origin: [f64; 3]) -> Result<Self> {
        Self::new([
            [voxel_size, 0.0, 0.0, origin[0]],
            [0.0, voxel_size, 0.0, origin[1]],
            [0.0, 0.0, voxel_size, origin[2]],
        ])
    }

    pub fn identity() -> Self {
        let matrix = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        Self {
            matrix,
            inverse: matrix,
        }
    }

    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        apply(&self.matrix, point)
    }

    pub fn apply_inverse(&self, point: [f64; 3]) -> [f64; 3] {
        apply(&self.inverse, point)
    }

    /// Length in mm of a unit step along each voxel axis.
    pub fn voxel_sizes(&self) -> [f64; 3] {
        let m = &self.matrix;
        [0, 1, 2].map(|col| (m[0][col].powi(2) + m[1][col].powi(2) + m[2][col].powi(2)).sqrt())
    }
}

fn apply(m: &[[f64; 4]; 3], p: [f64; 3]) -> [f64; 3] {
    [0, 1, 2].map(|row| m[row][0] * p[0] + m[row][1] * p[1] + m[row][2] * p[2] + m[row][3])
}

fn invert(m: &[[f64; 4]; 3]) -> Option<[[f64; 4]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if !det.is_finite() || det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inv = [[0.0; 4]; 3];
    inv[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
    inv[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
    inv[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
    inv[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
    inv[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
    inv[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
    inv[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
    inv[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
    inv[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
    for row in 0..3 {
        inv[row][3] = -(inv[row][0] * m[0][3] + inv[row][1] * m[1][3] + inv[row][2] * m[2][3]);
    }
    Some(inv)
}

/// The set of voxels eligible for analysis.
///
/// In-mask voxels are ordered in C order over `(i, j, k)`; every map in this
/// crate is a dense vector over that ordering.
#[derive(Debug, Clone)]
pub struct Mask {
    shape: [usize; 3],
    affine: Affine,
    voxels: Vec<[usize; 3]>,
    lookup: Vec<Option<usize>>,
}
impl Mask {
    /// Builds a mask from a dense C-ordered boolean volume.
    pub fn new(shape: [usize; 3], data: &[bool], affine: Affine) -> Result<Self> {
        let n_grid = shape.iter().product::<usize>();
        if n_grid == 0 {
            return Err(MetaError::input("mask", "grid has a zero-length axis"));
        }
        if data.len() != n_grid {
            return Err(MetaError::input(
                "mask",
                format!(
                    "volume has {} values but shape {:?} needs {}",
                    data.len(),
                    shape,
                    n_grid
                ),
            ));
        }

        let mut voxels = Vec::new();
        let mut lookup = vec![None; n_grid];
        for (flat, inside) in data.iter().enumerate() {
            if *inside {
                lookup[flat] = Some(voxels.len());
                voxels.push(unflatten(flat, shape));
            }
        }
        if voxels.is_empty() {
            return Err(MetaError::input("mask", "mask contains no voxels"));
        }

        Ok(Self {
            shape,
            affine,
            voxels,
            lookup,
        })
    }

    /// A mask where every voxel of the grid is in-mask.
    pub fn full(shape: [usize; 3], affine: Affine) -> Result<Self> {
        let data = vec![true; shape.iter().product()];
        Self::new(shape, &data, affine)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    pub fn n_voxels(&self) -> usize {
        self.voxels.len()
    }

    /// Grid index of the in-mask voxel at `position`.
    pub fn ijk(&self, position: usize) -> [usize; 3] {
        self.voxels[position]
    }

    pub fn voxels(&self) -> &[[usize; 3]] {
        &self.voxels
    }

    /// Mask position of a (possibly out-of-grid) voxel index.
    pub fn position(&self, ijk: [i64; 3]) -> Option<usize> {
        if !self.in_bounds(ijk) {
            return None;
        }
        let flat = flatten([ijk[0] as usize, ijk[1] as usize, ijk[2] as usize], self.shape);
        self.lookup[flat]
    }

    pub fn in_bounds(&self, ijk: [i64; 3]) -> bool {
        ijk.iter()
            .zip(self.shape.iter())
            .all(|(c, n)| *c >= 0 && (*c as usize) < *n)
    }

    /// Nearest voxel index for a world coordinate, which may lie outside the grid.
    pub fn world_to_voxel(&self, xyz: [f64; 3]) -> [i64; 3] {
        self.affine.apply_inverse(xyz).map(|c| c.round() as i64)
    }

    pub fn voxel_to_world(&self, ijk: [usize; 3]) -> [f64; 3] {
        self.affine.apply(ijk.map(|c| c as f64))
    }

    pub fn voxel_sizes(&self) -> [f64; 3] {
        self.affine.voxel_sizes()
    }

    pub fn voxel_volume_mm3(&self) -> f64 {
        self.voxel_sizes().iter().product()
    }

    /// Scatters a map over mask voxels into a dense C-ordered volume, NaN outside the mask.
    pub fn unmask(&self, values: &[f64]) -> Result<Vec<f64>> {
        if values.len() != self.n_voxels() {
            return Err(MetaError::input(
                "map",
                format!(
                    "map has {} values but the mask has {} voxels",
                    values.len(),
                    self.n_voxels()
                ),
            ));
        }
        let mut volume = vec![f64::NAN; self.lookup.len()];
        for (value, ijk) in values.iter().zip(self.voxels.iter()) {
            volume[flatten(*ijk, self.shape)] = *value;
        }
        Ok(volume)
    }
}

pub(crate) fn flatten(ijk: [usize; 3], shape: [usize; 3]) -> usize {
    (ijk[0] * shape[1] + ijk[1]) * shape[2] + ijk[2]
}

fn unflatten(flat: usize, shape: [usize; 3]) -> [usize; 3] {
    let k = flat % shape[2];
    let j = (flat / shape[2]) % shape[1];
    let i = flat / (shape[1] * shape[2]);
    [i, j, k]
}
