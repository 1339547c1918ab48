use adjustp::{adjust, Procedure};
use ndarray::Array1;
use tracing::{debug, info, warn};

use crate::{
    cluster::{cluster_table, label_clusters},
    config::{ClusterMetric, CorrectionConfig, CorrectionMethod},
    error::{ConfigError, Result},
    mask::Mask,
    math::{empirical_pvalue, p_to_z},
    null::NullDistribution,
    results::{CorrectedResult, GroupStatisticMap, Tail},
};

/// Turns voxel-wise evidence into multiplicity-corrected significance calls.
///
/// Correction is a pure function of the statistic map and its null; neither
/// input is modified.
#[derive(Debug, Clone)]
pub struct Corrector {
    config: CorrectionConfig,
}
impl Corrector {
    pub fn new(config: CorrectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    pub fn correct(
        &self,
        mask: &Mask,
        statistic: &GroupStatisticMap,
        null: &NullDistribution,
    ) -> Result<CorrectedResult> {
        info!(method = self.config.method.label(), "Performing correction...");
        let p_uncorrected = null.pvalues(statistic)?;

        let p_corrected = match self.config.method {
            CorrectionMethod::None => p_uncorrected.clone(),
            CorrectionMethod::Bonferroni => {
                Array1::from(adjust(&p_uncorrected.to_vec(), Procedure::Bonferroni))
            }
            CorrectionMethod::Fdr { procedure } => {
                Array1::from(procedure.adjust(&p_uncorrected.to_vec()))
            }
            CorrectionMethod::FweVoxel => self.fwe_voxel(statistic, null)?,
            CorrectionMethod::FweCluster { metric, .. } => {
                self.fwe_cluster(mask, statistic, null, metric)?
            }
        };

        let significant = p_corrected
            .iter()
            .map(|p| *p < self.config.alpha)
            .collect::<Vec<_>>();
        let z = signed_z(statistic, &p_corrected);

        let mut result = CorrectedResult {
            method: self.config.method,
            alpha: self.config.alpha,
            p_uncorrected,
            p_corrected,
            z,
            significant,
            clusters: Vec::new(),
        };
        let labels = result.significant_clusters(mask, statistic, self.config.connectivity);
        if labels.is_empty() {
            warn!("No significant clusters found");
        }
        result.clusters = cluster_table(mask, statistic.values.view(), &labels);
        debug!(
            n_significant = result.n_significant(),
            n_clusters = result.clusters.len(),
            "correction complete"
        );
        Ok(result)
    }

    /// Compares each voxel against the distribution of the per-draw maximum.
    fn fwe_voxel(
        &self,
        statistic: &GroupStatisticMap,
        null: &NullDistribution,
    ) -> Result<Array1<f64>> {
        let max_stat = null
            .max_stat
            .as_ref()
            .ok_or(ConfigError::MissingMonteCarlo("voxel-level family-wise error correction"))?;
        Ok(statistic
            .values
            .mapv(|v| empirical_pvalue(statistic.tail.magnitude(v), &max_stat.max_stat)))
    }

    /// Gives every voxel of a supra-threshold cluster the p-value of its
    /// cluster extent against the per-draw maximum extent. Voxels outside any
    /// cluster get p = 1.
    fn fwe_cluster(
        &self,
        mask: &Mask,
        statistic: &GroupStatisticMap,
        null: &NullDistribution,
        metric: ClusterMetric,
    ) -> Result<Array1<f64>> {
        let cluster_null = null
            .max_stat
            .as_ref()
            .and_then(|m| m.cluster.as_ref())
            .ok_or(ConfigError::MissingClusterThreshold)?;
        let labels = label_clusters(
            mask,
            statistic.values.view(),
            cluster_null.threshold,
            statistic.tail,
            self.config.connectivity,
        );
        debug!(
            threshold = cluster_null.threshold,
            n_clusters = labels.clusters.len(),
            "observed clusters"
        );

        let mut pvalues = Array1::ones(statistic.n_voxels());
        for cluster in labels.clusters.iter() {
            let p = match metric {
                ClusterMetric::Size => empirical_pvalue(cluster.size() as f64, &cluster_null.sizes),
                ClusterMetric::Mass => {
                    empirical_pvalue(cluster.mass(statistic.values.view()), &cluster_null.masses)
                }
            };
            for voxel in cluster.voxels.iter() {
                pvalues[*voxel] = p;
            }
        }
        Ok(pvalues)
    }
}

/// One-sided z of each p-value, carrying the sign of two-sided statistics.
fn signed_z(statistic: &GroupStatisticMap, pvalues: &Array1<f64>) -> Array1<f64> {
    pvalues
        .iter()
        .zip(statistic.values.iter())
        .map(|(p, v)| {
            let z = p_to_z(*p).max(0.0);
            match statistic.tail {
                Tail::Upper => z,
                Tail::TwoSided if *v < 0.0 => -z,
                Tail::TwoSided => z,
            }
        })
        .collect()
}
