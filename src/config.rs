use std::time::Duration;

use adjustp::{adjust, Procedure};
use bon::Builder;

use crate::error::ConfigError;

/// Kernel width of a Gaussian (ALE) kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelWidth {
    /// Full width at half maximum in mm.
    Fixed(f64),
    /// Derived from the study sample size with the ALE uncertainty model.
    SampleSize,
}

/// Density inside a fixed-radius sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SphereDensity {
    Uniform(f64),
    /// Decays linearly from 1 at the centre to 0 at the radius.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelConfig {
    Gaussian { fwhm: KernelWidth },
    Sphere { radius_mm: f64, density: SphereDensity },
}
impl KernelConfig {
    /// The ALE kernel with sample-size dependent width.
    pub fn ale() -> Self {
        KernelConfig::Gaussian {
            fwhm: KernelWidth::SampleSize,
        }
    }

    /// The binary 10mm sphere used by MKDA and KDA.
    pub fn mkda() -> Self {
        KernelConfig::Sphere {
            radius_mm: 10.0,
            density: SphereDensity::Uniform(1.0),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            KernelConfig::Gaussian {
                fwhm: KernelWidth::Fixed(fwhm),
            } => positive("kernel.fwhm", *fwhm),
            KernelConfig::Gaussian { .. } => Ok(()),
            KernelConfig::Sphere { radius_mm, density } => {
                positive("kernel.radius_mm", *radius_mm)?;
                match density {
                    SphereDensity::Uniform(value) => positive("kernel.density", *value),
                    SphereDensity::Linear => Ok(()),
                }
            }
        }
    }
}

/// How foci of a single study combine where their kernels overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FociCombine {
    /// Keep the largest value; avoids double counting nearby foci.
    #[default]
    Max,
    Sum,
}

/// Rule applied to pre-computed statistical maps in place of a kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MapRule {
    /// 1 where the value exceeds the threshold, 0 elsewhere.
    Binarize { threshold: f64 },
    /// Keeps values above the threshold, 0 elsewhere.
    Threshold { threshold: f64 },
    Identity,
}

/// What to do with coordinates whose nearest voxel lies outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutOfBoundsPolicy {
    /// Fail with an input error naming the study and the focus.
    #[default]
    Reject,
    /// Drop the focus and log a warning.
    Drop,
}

#[derive(Debug, Clone, Builder)]
pub struct KernelSettings {
    pub kernel: KernelConfig,
    #[builder(default)]
    pub combine: FociCombine,
    #[builder(default = MapRule::Identity)]
    pub map_rule: MapRule,
    #[builder(default)]
    pub out_of_bounds: OutOfBoundsPolicy,
}
impl KernelSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kernel.validate()?;
        match self.map_rule {
            MapRule::Binarize { threshold } | MapRule::Threshold { threshold } => {
                finite("kernel.map_rule.threshold", threshold)
            }
            MapRule::Identity => Ok(()),
        }
    }

    /// Union aggregation treats modeled activation as a probability, so the
    /// kernel must never render values above 1.
    fn check_probabilities(&self) -> Result<(), ConfigError> {
        if self.combine == FociCombine::Sum {
            return Err(ConfigError::Incompatible(
                "union aggregation cannot combine foci by sum".to_string(),
            ));
        }
        match self.kernel {
            KernelConfig::Sphere {
                density: SphereDensity::Uniform(value),
                ..
            } if value > 1.0 => Err(ConfigError::Incompatible(format!(
                "union aggregation needs a sphere density of at most 1, got {value}"
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StudyWeighting {
    #[default]
    Uniform,
    /// Square root of the study sample size.
    SampleSize,
}
impl StudyWeighting {
    pub fn weight(&self, sample_size: Option<usize>) -> Option<f64> {
        match self {
            StudyWeighting::Uniform => Some(1.0),
            StudyWeighting::SampleSize => sample_size.map(|n| (n as f64).sqrt()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorConfig {
    /// ALE: probability that at least one study activates the voxel.
    Union,
    /// MKDA / KDA density: weighted sum of modeled activation.
    Sum { weighting: StudyWeighting },
    /// Signed likelihood-ratio contrast of activation proportions against a
    /// reference study set, or against the uniform rate when there is none.
    Specificity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmpiricalMode {
    /// All resampled voxel values pooled into one voxel-shared histogram.
    #[default]
    Pooled,
    /// A separate resampled distribution for every voxel.
    PerVoxel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullStrategy {
    Analytic,
    Empirical { mode: EmpiricalMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawMode {
    /// Foci redrawn uniformly over mask voxels.
    #[default]
    Uniform,
    /// The observed foci positions shuffled across studies.
    Permute,
}

#[derive(Debug, Clone, Builder)]
pub struct MonteCarloConfig {
    #[builder(default = 10_000)]
    pub n_resamples: usize,
    #[builder(default = 0)]
    pub seed: u64,
    /// Worker threads; the rayon default when unset.
    pub n_workers: Option<usize>,
    #[builder(default)]
    pub draw: DrawMode,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FdrProcedure {
    #[default]
    BenjaminiHochberg,
    BenjaminiYekutieli,
}
impl FdrProcedure {
    pub fn adjust(&self, pvalues: &[f64]) -> Vec<f64> {
        match self {
            FdrProcedure::BenjaminiHochberg => adjust(pvalues, Procedure::BenjaminiHochberg),
            FdrProcedure::BenjaminiYekutieli => adjust(pvalues, Procedure::BenjaminiYekutieli),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClusterFormingThreshold {
    /// Uncorrected voxel p-value, converted through the voxel-shared null.
    PValue(f64),
    Statistic(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterMetric {
    #[default]
    Size,
    /// Sum of supra-threshold statistic magnitudes.
    Mass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionMethod {
    None,
    Bonferroni,
    Fdr {
        procedure: FdrProcedure,
    },
    FweVoxel,
    FweCluster {
        threshold: Option<ClusterFormingThreshold>,
        metric: ClusterMetric,
    },
}
impl CorrectionMethod {
    pub fn needs_resampling(&self) -> bool {
        matches!(
            self,
            CorrectionMethod::FweVoxel | CorrectionMethod::FweCluster { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            CorrectionMethod::None => "uncorrected",
            CorrectionMethod::Bonferroni => "bonferroni",
            CorrectionMethod::Fdr {
                procedure: FdrProcedure::BenjaminiHochberg,
            } => "fdr-bh",
            CorrectionMethod::Fdr {
                procedure: FdrProcedure::BenjaminiYekutieli,
            } => "fdr-by",
            CorrectionMethod::FweVoxel => "fwe-voxel",
            CorrectionMethod::FweCluster {
                metric: ClusterMetric::Size,
                ..
            } => "fwe-cluster-size",
            CorrectionMethod::FweCluster {
                metric: ClusterMetric::Mass,
                ..
            } => "fwe-cluster-mass",
        }
    }
}

/// Voxel adjacency used for connected-component extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// 6 neighbours sharing a face.
    #[default]
    Faces,
    /// 18 neighbours sharing a face or an edge.
    FacesEdges,
    /// 26 neighbours sharing a face, edge or corner.
    FacesEdgesCorners,
}
impl Connectivity {
    pub fn offsets(&self) -> Vec<[i64; 3]> {
        let max_order = match self {
            Connectivity::Faces => 1,
            Connectivity::FacesEdges => 2,
            Connectivity::FacesEdgesCorners => 3,
        };
        let mut offsets = Vec::new();
        for di in -1..=1_i64 {
            for dj in -1..=1_i64 {
                for dk in -1..=1_i64 {
                    let order = di.abs() + dj.abs() + dk.abs();
                    if order > 0 && order <= max_order {
                        offsets.push([di, dj, dk]);
                    }
                }
            }
        }
        offsets
    }
}

#[derive(Debug, Clone, Builder)]
pub struct CorrectionConfig {
    pub method: CorrectionMethod,
    #[builder(default = 0.05)]
    pub alpha: f64,
    #[builder(default)]
    pub connectivity: Connectivity,
}

/// Full configuration of a coordinate/image-based meta-analysis run.
#[derive(Debug, Clone, Builder)]
pub struct AnalysisConfig {
    pub kernel: KernelSettings,
    pub aggregator: AggregatorConfig,
    #[builder(default = NullStrategy::Analytic)]
    pub null: NullStrategy,
    pub monte_carlo: Option<MonteCarloConfig>,
    pub correction: CorrectionConfig,
    /// Bin width of histogram nulls, in statistic units.
    #[builder(default = 1e-4)]
    pub histogram_bin_width: f64,
    /// Keep the per-study modeled activation maps in the result.
    #[builder(default = false)]
    pub keep_modeled_activation: bool,
}
impl AnalysisConfig {
    /// Checks every option and their combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kernel.validate()?;
        positive("histogram_bin_width", self.histogram_bin_width)?;
        if self.aggregator == AggregatorConfig::Union {
            self.kernel.check_probabilities()?;
        }

        let alpha = self.correction.alpha;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "correction.alpha",
                expected: "in (0, 1)",
                value: alpha,
            });
        }

        let empirical = matches!(self.null, NullStrategy::Empirical { .. });
        if empirical || self.correction.method.needs_resampling() {
            let requester = if empirical {
                "the empirical null"
            } else {
                "family-wise error correction"
            };
            let monte_carlo = self
                .monte_carlo
                .as_ref()
                .ok_or(ConfigError::MissingMonteCarlo(requester))?;
            if monte_carlo.n_resamples == 0 {
                return Err(ConfigError::NoResamples);
            }
            let required = (1.0 / alpha).floor() as usize + 1;
            if monte_carlo.n_resamples < required {
                return Err(ConfigError::UnderpoweredResampling {
                    n_resamples: monte_carlo.n_resamples,
                    alpha,
                    required,
                });
            }
            if monte_carlo.n_workers == Some(0) {
                return Err(ConfigError::OutOfRange {
                    field: "monte_carlo.n_workers",
                    expected: "at least 1",
                    value: 0.0,
                });
            }
        }

        if let CorrectionMethod::FweCluster { threshold, .. } = self.correction.method {
            match threshold.ok_or(ConfigError::MissingClusterThreshold)? {
                ClusterFormingThreshold::PValue(p) => {
                    if !(p > 0.0 && p < 1.0) {
                        return Err(ConfigError::OutOfRange {
                            field: "cluster-forming p-value",
                            expected: "in (0, 1)",
                            value: p,
                        });
                    }
                    if self.null
                        == (NullStrategy::Empirical {
                            mode: EmpiricalMode::PerVoxel,
                        })
                    {
                        return Err(ConfigError::ClusterThresholdNeedsSharedNull);
                    }
                }
                ClusterFormingThreshold::Statistic(t) => finite("cluster-forming statistic", t)?,
            }
        }

        Ok(())
    }

    /// Whether any part of the run needs Monte-Carlo resampling.
    pub fn needs_resampling(&self) -> bool {
        matches!(self.null, NullStrategy::Empirical { .. })
            || self.correction.method.needs_resampling()
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            expected: "finite and positive",
            value,
        })
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            expected: "finite",
            value,
        })
    }
}
