use std::collections::BTreeMap;

use ndarray::Array1;
use tracing::{debug, info};

use crate::{
    aggregate::Aggregator,
    config::{
        AggregatorConfig, AnalysisConfig, ClusterFormingThreshold, Connectivity, CorrectionMethod,
        EmpiricalMode, MonteCarloConfig, NullStrategy,
    },
    error::{ConfigError, MetaError, Result},
    histogram::{combine_pmfs, map_pmf, BinOp, HistogramNull, Pmf},
    kernel::{ModeledActivationMap, PreparedStudy, SpatialKernelTransformer},
    mask::Mask,
    math::{chi_squared_isf, chi_squared_sf, empirical_pvalue, normal_sf, p_to_z},
    montecarlo::{CancelToken, DrawRequest, DrawSummary, MonteCarlo},
    results::{GroupStatisticMap, Tail},
    study::Study,
};

/// Prepared studies of one group with their rendered maps and weights.
#[derive(Debug, Clone)]
pub struct StudyGroup {
    pub prepared: Vec<PreparedStudy>,
    pub maps: Vec<ModeledActivationMap>,
    pub weights: Vec<f64>,
}
impl StudyGroup {
    fn prepare(
        transformer: &SpatialKernelTransformer,
        aggregator: &Aggregator,
        mask: &Mask,
        studies: &[Study],
    ) -> Result<Self> {
        let prepared = transformer.prepare_all(studies)?;
        let maps = prepared.iter().map(|p| p.render(mask)).collect::<Vec<_>>();
        let weights = aggregator.weights(&maps)?;
        Ok(Self {
            prepared,
            maps,
            weights,
        })
    }
}

/// The read-only study inputs shared by every resampling draw.
#[derive(Debug, Clone)]
pub struct StudySet {
    pub target: StudyGroup,
    pub reference: Option<StudyGroup>,
}
impl StudySet {
    pub fn prepare(
        transformer: &SpatialKernelTransformer,
        aggregator: &Aggregator,
        target: &[Study],
        reference: Option<&[Study]>,
    ) -> Result<Self> {
        if target.is_empty() {
            return Err(MetaError::input("studies", "no studies supplied"));
        }
        let mask = transformer.mask();
        let target = StudyGroup::prepare(transformer, aggregator, mask, target)?;
        let reference = reference
            .map(|studies| StudyGroup::prepare(transformer, aggregator, mask, studies))
            .transpose()?;
        Ok(Self { target, reference })
    }

    /// The observed group statistic.
    pub fn statistic(&self, aggregator: &Aggregator) -> Result<GroupStatisticMap> {
        aggregator.aggregate(
            &self.target.maps,
            self.reference.as_ref().map(|r| r.maps.as_slice()),
        )
    }
}

/// A single distribution shared by every voxel.
#[derive(Debug, Clone)]
pub enum SharedNull {
    Histogram(HistogramNull),
    ChiSquared { df: f64 },
    StandardNormal,
}
impl SharedNull {
    /// Upper-tail p-value of a statistic magnitude.
    pub fn pvalue(&self, magnitude: f64) -> f64 {
        match self {
            SharedNull::Histogram(histogram) => histogram.pvalue(magnitude),
            SharedNull::ChiSquared { df } => chi_squared_sf(magnitude, *df),
            SharedNull::StandardNormal => normal_sf(magnitude),
        }
    }

    /// Magnitude whose p-value equals `p`.
    pub fn isf(&self, p: f64) -> f64 {
        match self {
            SharedNull::Histogram(histogram) => histogram.isf(p),
            SharedNull::ChiSquared { df } => chi_squared_isf(p, *df),
            SharedNull::StandardNormal => p_to_z(p),
        }
    }
}

/// Resampled statistic magnitudes for every voxel, each sorted ascending.
#[derive(Debug, Clone)]
pub struct PerVoxelNull {
    n_resamples: usize,
    sorted: Vec<Vec<f64>>,
}
impl PerVoxelNull {
    fn from_draws(draws: &[DrawSummary], n_voxels: usize) -> Self {
        let mut sorted = vec![Vec::with_capacity(draws.len()); n_voxels];
        for draw in draws {
            if let Some(values) = &draw.values {
                for (voxel, value) in values.iter().enumerate() {
                    sorted[voxel].push(*value);
                }
            }
        }
        sorted
            .iter_mut()
            .for_each(|values| values.sort_unstable_by(f64::total_cmp));
        Self {
            n_resamples: draws.len(),
            sorted,
        }
    }

    pub fn n_resamples(&self) -> usize {
        self.n_resamples
    }

    pub fn n_voxels(&self) -> usize {
        self.sorted.len()
    }

    pub fn pvalue(&self, voxel: usize, magnitude: f64) -> f64 {
        empirical_pvalue(magnitude, &self.sorted[voxel])
    }
}

#[derive(Debug, Clone)]
pub enum VoxelNull {
    Shared(SharedNull),
    PerVoxel(PerVoxelNull),
}

/// Per-draw maximum cluster extent above a fixed cluster-forming threshold.
#[derive(Debug, Clone)]
pub struct ClusterNull {
    pub threshold: f64,
    pub sizes: Vec<f64>,
    pub masses: Vec<f64>,
}

/// Per-draw maxima over the whole mask, for family-wise error control.
#[derive(Debug, Clone)]
pub struct MaxStatNull {
    /// Sorted ascending.
    pub max_stat: Vec<f64>,
    pub cluster: Option<ClusterNull>,
}
impl MaxStatNull {
    fn from_draws(draws: &[DrawSummary]) -> Self {
        let mut max_stat = draws.iter().map(|d| d.max_stat).collect::<Vec<_>>();
        max_stat.sort_unstable_by(f64::total_cmp);
        Self {
            max_stat,
            cluster: None,
        }
    }

    fn with_clusters(mut self, threshold: f64, draws: &[DrawSummary]) -> Self {
        let mut sizes = draws
            .iter()
            .map(|d| d.max_cluster_size as f64)
            .collect::<Vec<_>>();
        let mut masses = draws.iter().map(|d| d.max_cluster_mass).collect::<Vec<_>>();
        sizes.sort_unstable_by(f64::total_cmp);
        masses.sort_unstable_by(f64::total_cmp);
        self.cluster = Some(ClusterNull {
            threshold,
            sizes,
            masses,
        });
        self
    }
}

/// Distribution of the group statistic under the null hypothesis.
#[derive(Debug, Clone)]
pub struct NullDistribution {
    pub tail: Tail,
    pub voxel: VoxelNull,
    pub max_stat: Option<MaxStatNull>,
    pub n_resamples: Option<usize>,
}
impl NullDistribution {
    /// A voxel-shared parametric null without resampling.
    pub fn parametric(null: SharedNull, tail: Tail) -> Self {
        Self {
            tail,
            voxel: VoxelNull::Shared(null),
            max_stat: None,
            n_resamples: None,
        }
    }

    /// Uncorrected voxel-wise p-values of a statistic map.
    pub fn pvalues(&self, statistic: &GroupStatisticMap) -> Result<Array1<f64>> {
        match &self.voxel {
            VoxelNull::Shared(null) => Ok(statistic
                .values
                .mapv(|v| null.pvalue(self.tail.magnitude(v)))),
            VoxelNull::PerVoxel(null) => {
                if null.n_voxels() != statistic.n_voxels() {
                    return Err(MetaError::input(
                        "statistic",
                        format!(
                            "map has {} voxels but the null covers {}",
                            statistic.n_voxels(),
                            null.n_voxels()
                        ),
                    ));
                }
                Ok(statistic
                    .values
                    .indexed_iter()
                    .map(|(voxel, v)| null.pvalue(voxel, self.tail.magnitude(*v)))
                    .collect())
            }
        }
    }

    /// Smallest non-zero p-value an empirical null can produce.
    pub fn resolution(&self) -> Option<f64> {
        self.n_resamples.map(|n| 1.0 / n as f64)
    }

}

/// Estimates the null distribution of the group statistic.
pub struct NullDistributionEngine<'a> {
    mask: &'a Mask,
    aggregator: Aggregator,
    strategy: NullStrategy,
    monte_carlo: Option<MonteCarloConfig>,
    bin_width: f64,
    correction: CorrectionMethod,
    connectivity: Connectivity,
}
impl<'a> NullDistributionEngine<'a> {
    /// Builds the engine from an already validated configuration.
    pub fn new(mask: &'a Mask, config: &AnalysisConfig) -> Self {
        Self {
            mask,
            aggregator: Aggregator::new(config.aggregator),
            strategy: config.null,
            monte_carlo: config
                .monte_carlo
                .clone()
                .filter(|_| config.needs_resampling()),
            bin_width: config.histogram_bin_width,
            correction: config.correction.method,
            connectivity: config.correction.connectivity,
        }
    }

    pub fn estimate(&self, studies: &StudySet, cancel: &CancelToken) -> Result<NullDistribution> {
        let tail = self.aggregator.tail();
        info!("Estimating null distribution...");

        let analytic = match self.strategy {
            NullStrategy::Analytic => Some(self.analytic(studies)?),
            NullStrategy::Empirical { .. } => None,
        };

        let cluster_threshold = match self.correction {
            CorrectionMethod::FweCluster { threshold, .. } => threshold,
            _ => None,
        };
        let known_threshold = match (cluster_threshold, &analytic) {
            (Some(ClusterFormingThreshold::Statistic(t)), _) => Some(t),
            (Some(ClusterFormingThreshold::PValue(p)), Some(null)) => Some(null.isf(p)),
            _ => None,
        };

        let Some(monte_carlo) = &self.monte_carlo else {
            let voxel = analytic.ok_or(ConfigError::MissingMonteCarlo("the empirical null"))?;
            return Ok(NullDistribution::parametric(voxel, tail));
        };

        let request = DrawRequest {
            cluster_threshold: known_threshold,
            pooled_bin_width: (self.strategy
                == NullStrategy::Empirical {
                    mode: EmpiricalMode::Pooled,
                })
            .then_some(self.bin_width),
            per_voxel: self.strategy
                == NullStrategy::Empirical {
                    mode: EmpiricalMode::PerVoxel,
                },
        };
        let mc = MonteCarlo::new(
            self.mask,
            self.aggregator,
            studies,
            monte_carlo,
            self.connectivity,
        );
        let draws = mc.run(&request, cancel)?;
        debug!(n_draws = draws.len(), "Monte-Carlo draws complete");

        let voxel = match (self.strategy, analytic) {
            (NullStrategy::Analytic, Some(null)) => VoxelNull::Shared(null),
            (NullStrategy::Empirical { mode: EmpiricalMode::PerVoxel }, _) => {
                VoxelNull::PerVoxel(PerVoxelNull::from_draws(&draws, self.mask.n_voxels()))
            }
            _ => {
                let mut counts = BTreeMap::<usize, u64>::new();
                for draw in draws.iter() {
                    for (bin, count) in draw.counts.iter().flatten() {
                        *counts.entry(*bin).or_default() += count;
                    }
                }
                VoxelNull::Shared(SharedNull::Histogram(HistogramNull::from_counts(
                    &counts,
                    self.bin_width,
                )?))
            }
        };

        let mut max_stat = MaxStatNull::from_draws(&draws);
        match (cluster_threshold, known_threshold, &voxel) {
            (_, Some(threshold), _) => max_stat = max_stat.with_clusters(threshold, &draws),
            (Some(ClusterFormingThreshold::PValue(p)), None, VoxelNull::Shared(shared)) => {
                // the threshold depends on the pooled null, so replay the same draws
                let threshold = shared.isf(p);
                debug!(threshold, "replaying draws for cluster statistics");
                let replay = DrawRequest {
                    cluster_threshold: Some(threshold),
                    ..Default::default()
                };
                let cluster_draws = mc.run(&replay, cancel)?;
                max_stat = max_stat.with_clusters(threshold, &cluster_draws);
            }
            _ => {}
        }

        Ok(NullDistribution {
            tail,
            voxel,
            max_stat: Some(max_stat),
            n_resamples: Some(draws.len()),
        })
    }

    /// Closed-form voxel-shared null from the observed kernel maps.
    fn analytic(&self, studies: &StudySet) -> Result<SharedNull> {
        let op = match self.aggregator.config() {
            AggregatorConfig::Specificity => return Ok(SharedNull::ChiSquared { df: 1.0 }),
            AggregatorConfig::Union => BinOp::Union,
            AggregatorConfig::Sum { .. } => BinOp::Sum,
        };
        let mut null: Pmf = [(0, 1.0)].into_iter().collect();
        for (map, weight) in studies.target.maps.iter().zip(studies.target.weights.iter()) {
            let study = map_pmf(map.values.view(), *weight, self.bin_width);
            null = combine_pmfs(&null, &study, op, self.bin_width);
        }
        debug!(n_bins = null.len(), "analytic null histogram built");
        Ok(SharedNull::Histogram(HistogramNull::from_pmf(
            &null,
            self.bin_width,
        )?))
    }
}
