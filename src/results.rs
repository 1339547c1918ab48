use derive_new::new;
use ndarray::Array1;

use crate::{
    cluster::{label_significant, ClusterLabels, ClusterReport},
    config::{Connectivity, CorrectionMethod},
    error::Result,
    kernel::ModeledActivationMap,
    mask::Mask,
    null::NullDistribution,
};

/// Which tail of the statistic counts as evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    /// Large positive values (density statistics).
    Upper,
    /// Large absolute values (signed contrasts).
    TwoSided,
}
impl Tail {
    pub fn magnitude(&self, value: f64) -> f64 {
        match self {
            Tail::Upper => value,
            Tail::TwoSided => value.abs(),
        }
    }
}

/// One statistic value per mask voxel.
#[derive(new, Debug, Clone, PartialEq)]
pub struct GroupStatisticMap {
    pub values: Array1<f64>,
    pub tail: Tail,
}
impl GroupStatisticMap {
    pub fn n_voxels(&self) -> usize {
        self.values.len()
    }

    pub fn max_magnitude(&self) -> f64 {
        self.values
            .iter()
            .map(|v| self.tail.magnitude(*v))
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Dense volume over the mask grid, NaN outside the mask.
    pub fn to_volume(&self, mask: &Mask) -> Result<Vec<f64>> {
        mask.unmask(&self.values.to_vec())
    }
}

/// Multiplicity-corrected inference over one statistic map.
#[derive(Debug, Clone)]
pub struct CorrectedResult {
    pub method: CorrectionMethod,
    pub alpha: f64,
    pub p_uncorrected: Array1<f64>,
    /// Corrected p-values, or q-values for FDR procedures.
    pub p_corrected: Array1<f64>,
    /// One-sided z-scores of the corrected p-values.
    pub z: Array1<f64>,
    pub significant: Vec<bool>,
    /// Cluster table of significant voxels.
    pub clusters: Vec<ClusterReport>,
}
impl CorrectedResult {
    pub fn n_significant(&self) -> usize {
        self.significant.iter().filter(|s| **s).count()
    }

    /// Connected components of the significant voxels, one sign per cluster.
    pub fn significant_clusters(
        &self,
        mask: &Mask,
        statistic: &GroupStatisticMap,
        connectivity: Connectivity,
    ) -> ClusterLabels {
        label_significant(mask, statistic.values.view(), &self.significant, connectivity)
    }
}

/// Everything a coordinate- or image-based meta-analysis run produces.
#[derive(Debug, Clone)]
pub struct MetaResult {
    pub study_ids: Vec<String>,
    pub statistic: GroupStatisticMap,
    pub null: NullDistribution,
    pub corrected: CorrectedResult,
    /// Per-study maps, kept only when requested.
    pub modeled_activation: Option<Vec<ModeledActivationMap>>,
}
impl MetaResult {
    pub fn pprint(&self) {
        println!("Voxel\tStat\tP\tP corrected\tZ\tSignificant");
        for i in 0..self.statistic.n_voxels() {
            println!(
                "{}\t{}\t{}\t{}\t{}\t{}",
                i,
                self.statistic.values[i],
                self.corrected.p_uncorrected[i],
                self.corrected.p_corrected[i],
                self.corrected.z[i],
                self.corrected.significant[i]
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Affine;
    use ndarray::array;

    #[test]
    fn test_tail_magnitude() {
        assert_eq!(Tail::Upper.magnitude(-2.0), -2.0);
        assert_eq!(Tail::TwoSided.magnitude(-2.0), 2.0);
    }

    #[test]
    fn test_statistic_volume_is_nan_outside_mask() {
        let mask = Mask::new([1, 1, 3], &[true, false, true], Affine::identity()).unwrap();
        let stat = GroupStatisticMap::new(array![1.0, -4.0], Tail::TwoSided);
        assert_eq!(stat.max_magnitude(), 4.0);
        let volume = stat.to_volume(&mask).unwrap();
        assert_eq!(volume[0], 1.0);
        assert!(volume[1].is_nan());
        assert_eq!(volume[2], -4.0);
    }
}
