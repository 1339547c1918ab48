use ndarray::Array2;
use tracing::debug;

use crate::{
    error::{ConfigError, MetaError, Result},
    mask::Mask,
};

/// Columns whose total weight over the mask falls below this are dropped.
const MIN_SUPPORT: f64 = 1e-8;

/// Smooth spatial basis: one row per mask voxel, one column per basis function.
#[derive(Debug, Clone)]
pub struct SpatialBasis {
    matrix: Array2<f64>,
}
impl SpatialBasis {
    /// Tensor product of cubic B-splines with knots every `spacing` voxels.
    ///
    /// The splines form a partition of unity, so a constant coefficient vector
    /// gives a spatially flat log-intensity.
    pub fn bspline(mask: &Mask, spacing: usize) -> Result<Self> {
        if spacing == 0 {
            return Err(ConfigError::OutOfRange {
                field: "spline_spacing",
                expected: "at least 1 voxel",
                value: 0.0,
            }
            .into());
        }
        let axes = mask.shape().map(|dim| axis_basis(dim, spacing));
        let n_knots = axes.clone().map(|a| a.ncols());

        let mut columns = Vec::new();
        for a in 0..n_knots[0] {
            for b in 0..n_knots[1] {
                for c in 0..n_knots[2] {
                    let column = mask
                        .voxels()
                        .iter()
                        .map(|[i, j, k]| axes[0][[*i, a]] * axes[1][[*j, b]] * axes[2][[*k, c]])
                        .collect::<Vec<_>>();
                    if column.iter().sum::<f64>() > MIN_SUPPORT {
                        columns.push(column);
                    }
                }
            }
        }
        debug!(
            n_bases = columns.len(),
            n_candidates = n_knots.iter().product::<usize>(),
            "B-spline basis built"
        );

        let mut matrix = Array2::zeros((mask.n_voxels(), columns.len()));
        for (col, values) in columns.iter().enumerate() {
            for (row, v) in values.iter().enumerate() {
                matrix[[row, col]] = *v;
            }
        }
        Ok(Self { matrix })
    }

    /// A caller-supplied basis with one row per mask voxel.
    pub fn custom(mask: &Mask, matrix: Array2<f64>) -> Result<Self> {
        if matrix.nrows() != mask.n_voxels() {
            return Err(MetaError::input(
                "basis",
                format!(
                    "basis has {} rows but the mask has {} voxels",
                    matrix.nrows(),
                    mask.n_voxels()
                ),
            ));
        }
        if matrix.ncols() == 0 || matrix.iter().any(|v| !v.is_finite()) {
            return Err(MetaError::input(
                "basis",
                "basis must have at least one column and finite entries",
            ));
        }
        Ok(Self { matrix })
    }

    pub fn n_bases(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }
}

/// Cardinal cubic B-spline, supported on (-2, 2).
fn cubic_bspline(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        (4.0 - 6.0 * t * t + 3.0 * t * t * t) / 6.0
    } else if t < 2.0 {
        (2.0 - t).powi(3) / 6.0
    } else {
        0.0
    }
}

/// Splines along one axis of `dim` voxels; knots run one spacing past each end.
fn axis_basis(dim: usize, spacing: usize) -> Array2<f64> {
    let interior = (dim.saturating_sub(1)).div_ceil(spacing);
    let knots = (-1..=interior as i64 + 1).collect::<Vec<_>>();
    let mut basis = Array2::zeros((dim, knots.len()));
    for voxel in 0..dim {
        for (col, knot) in knots.iter().enumerate() {
            let t = (voxel as f64 - (*knot * spacing as i64) as f64) / spacing as f64;
            basis[[voxel, col]] = cubic_bspline(t);
        }
    }
    basis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Affine;
    use approx::assert_relative_eq;

    #[test]
    fn test_partition_of_unity() {
        let mask = Mask::full([7, 9, 5], Affine::identity()).unwrap();
        let basis = SpatialBasis::bspline(&mask, 3).unwrap();
        for row in basis.matrix().rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_unsupported_columns_dropped() {
        let mut data = vec![false; 12 * 12 * 12];
        // a single corner voxel
        data[0] = true;
        let mask = Mask::new([12, 12, 12], &data, Affine::identity()).unwrap();
        let basis = SpatialBasis::bspline(&mask, 4).unwrap();
        // knots -1, 0 and 1 reach voxel 0 along each axis
        assert_eq!(basis.n_bases(), 27);
    }

    #[test]
    fn test_custom_basis_shape_checked() {
        let mask = Mask::full([2, 2, 2], Affine::identity()).unwrap();
        assert!(SpatialBasis::custom(&mask, Array2::ones((8, 2))).is_ok());
        assert!(matches!(
            SpatialBasis::custom(&mask, Array2::ones((7, 2))),
            Err(MetaError::InputData { .. })
        ));
    }
}
