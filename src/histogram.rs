use std::collections::BTreeMap;

use ndarray::ArrayView1;

use crate::{
    error::{FailureReason, FitFailure, MetaError, Result},
    math::MIN_PVALUE,
};

/// Sparse probability mass over histogram bins.
pub type Pmf = BTreeMap<usize, f64>;

/// How two independent binned variables combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `1 - (1 - a)(1 - b)`
    Union,
    /// `a + b`
    Sum,
}

pub fn bin_index(value: f64, bin_width: f64) -> usize {
    (value.max(0.0) / bin_width).round() as usize
}

/// Histogram of one map's values, normalised to a probability mass.
pub fn map_pmf(values: ArrayView1<f64>, scale: f64, bin_width: f64) -> Pmf {
    let mut counts = BTreeMap::<usize, u64>::new();
    for value in values.iter() {
        *counts.entry(bin_index(value * scale, bin_width)).or_default() += 1;
    }
    let total = values.len() as f64;
    counts
        .into_iter()
        .map(|(bin, count)| (bin, count as f64 / total))
        .collect()
}

/// Distribution of `a op b` for independent `a ~ lhs`, `b ~ rhs`.
pub fn combine_pmfs(lhs: &Pmf, rhs: &Pmf, op: BinOp, bin_width: f64) -> Pmf {
    let mut combined = Pmf::new();
    for (a_bin, a_mass) in lhs {
        for (b_bin, b_mass) in rhs {
            let bin = match op {
                BinOp::Sum => a_bin + b_bin,
                BinOp::Union => {
                    let a = *a_bin as f64 * bin_width;
                    let b = *b_bin as f64 * bin_width;
                    bin_index(1.0 - (1.0 - a) * (1.0 - b), bin_width)
                }
            };
            *combined.entry(bin).or_default() += a_mass * b_mass;
        }
    }
    combined
}

/// A voxel-shared null stored as an upper-tail survival function over bins.
#[derive(Debug, Clone)]
pub struct HistogramNull {
    bin_width: f64,
    survival: Vec<f64>,
    min_pvalue: f64,
}
impl HistogramNull {
    /// Builds the null from a probability mass, rejecting zero-variance nulls.
    pub fn from_pmf(pmf: &Pmf, bin_width: f64) -> Result<Self> {
        Self::from_masses(pmf.iter().map(|(b, m)| (*b, *m)), bin_width, MIN_PVALUE)
    }

    /// Builds the null from pooled resampled counts.
    ///
    /// P-values are bounded below by one over the number of pooled values.
    pub fn from_counts(counts: &BTreeMap<usize, u64>, bin_width: f64) -> Result<Self> {
        let total = counts.values().sum::<u64>().max(1) as f64;
        Self::from_masses(
            counts.iter().map(|(b, c)| (*b, *c as f64)),
            bin_width,
            1.0 / total,
        )
    }

    fn from_masses(
        masses: impl Iterator<Item = (usize, f64)>,
        bin_width: f64,
        min_pvalue: f64,
    ) -> Result<Self> {
        let masses = masses.filter(|(_, m)| *m > 0.0).collect::<Vec<_>>();
        if masses.len() < 2 {
            return Err(MetaError::Numerical(FitFailure {
                reason: FailureReason::DegenerateNull,
                iterations: 0,
                log_likelihood: f64::NAN,
                criterion: 0.0,
            }));
        }
        let total = masses.iter().map(|(_, m)| m).sum::<f64>();
        let n_bins = masses.iter().map(|(b, _)| *b).max().unwrap_or(0) + 1;
        let mut pmf = vec![0.0; n_bins];
        for (bin, mass) in masses {
            pmf[bin] += mass / total;
        }
        let mut survival = vec![0.0; n_bins];
        let mut running = 0.0;
        for bin in (0..n_bins).rev() {
            running += pmf[bin];
            survival[bin] = running.min(1.0);
        }
        Ok(Self {
            bin_width,
            survival,
            min_pvalue,
        })
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    /// `P(X >= value)` under the null.
    pub fn pvalue(&self, value: f64) -> f64 {
        let bin = bin_index(value, self.bin_width);
        self.survival
            .get(bin)
            .copied()
            .unwrap_or(0.0)
            .max(self.min_pvalue)
    }

    /// Smallest statistic value whose p-value is at most `p`.
    pub fn isf(&self, p: f64) -> f64 {
        let bin = self
            .survival
            .iter()
            .position(|s| *s <= p)
            .unwrap_or(self.survival.len());
        (bin as f64 - 0.5).max(0.0) * self.bin_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_map_pmf_normalised() {
        let values = array![0.0, 0.0, 1.0, 2.0];
        let pmf = map_pmf(values.view(), 1.0, 1.0);
        assert_relative_eq!(pmf[&0], 0.5);
        assert_relative_eq!(pmf[&1], 0.25);
        assert_relative_eq!(pmf.values().sum::<f64>(), 1.0);
    }

    #[test]
    fn test_sum_convolution() {
        let coin: Pmf = [(0, 0.5), (1, 0.5)].into_iter().collect();
        let two = combine_pmfs(&coin, &coin, BinOp::Sum, 1.0);
        assert_relative_eq!(two[&0], 0.25);
        assert_relative_eq!(two[&1], 0.5);
        assert_relative_eq!(two[&2], 0.25);
    }

    #[test]
    fn test_union_convolution() {
        let width = 0.25;
        let lhs: Pmf = [(0, 0.5), (2, 0.5)].into_iter().collect();
        let combined = combine_pmfs(&lhs, &lhs, BinOp::Union, width);
        // 1 - 0.5 * 0.5 = 0.75 lands in bin 3
        assert_relative_eq!(combined[&3], 0.25);
        assert_relative_eq!(combined[&2], 0.5);
        assert_relative_eq!(combined[&0], 0.25);
    }

    #[test]
    fn test_survival_pvalues() {
        let pmf: Pmf = [(0, 0.25), (1, 0.5), (2, 0.25)].into_iter().collect();
        let null = HistogramNull::from_pmf(&pmf, 1.0).unwrap();
        assert_relative_eq!(null.pvalue(0.0), 1.0);
        assert_relative_eq!(null.pvalue(1.0), 0.75);
        assert_relative_eq!(null.pvalue(2.0), 0.25);
        assert_eq!(null.pvalue(3.0), MIN_PVALUE);
        assert_relative_eq!(null.isf(0.3), 1.5);
    }

    #[test]
    fn test_degenerate_null_is_numerical_error() {
        let pmf: Pmf = [(3, 1.0)].into_iter().collect();
        let result = HistogramNull::from_pmf(&pmf, 1.0);
        assert!(matches!(result, Err(MetaError::Numerical(_))));
    }

    #[test]
    fn test_pooled_counts_floor() {
        let counts = [(0_usize, 3_u64), (1, 1)].into_iter().collect();
        let null = HistogramNull::from_counts(&counts, 1.0).unwrap();
        assert_relative_eq!(null.pvalue(5.0), 0.25);
    }
}
