//! metamap: coordinate- and image-based meta-analysis of neuroimaging results
//!
//! This library combines activation coordinates or statistical maps reported by
//! independent studies into one group-level spatial inference over a voxel
//! mask, with family-wise or false-discovery-rate control across voxels.
//!
//! The main components of this library are:
//! - `SpatialKernelTransformer`: renders each study as a modeled activation map
//! - `Aggregator`: reduces the per-study maps to a group statistic
//! - `NullDistributionEngine`: analytic or Monte-Carlo null distributions
//! - `Corrector`: Bonferroni, FDR, voxel- and cluster-level FWE correction
//! - `MetaAnalysis` / `cbma_workflow`: the end-to-end pipeline with diagnostics
//! - `RegressionEstimator`: Poisson / negative binomial meta-regression

mod aggregate;
mod cluster;
mod config;
mod correct;
mod diagnostics;
mod error;
mod histogram;
mod kernel;
mod mask;
mod math;
mod montecarlo;
mod null;
mod regression;
mod results;
mod study;
mod workflow;

pub use aggregate::Aggregator;
pub use cluster::{
    cluster_table, label_clusters, pprint_clusters, Cluster, ClusterLabels, ClusterReport,
};
pub use config::{
    AggregatorConfig, AnalysisConfig, ClusterFormingThreshold, ClusterMetric, Connectivity,
    CorrectionConfig, CorrectionMethod, DrawMode, EmpiricalMode, FdrProcedure, FociCombine,
    KernelConfig, KernelSettings, KernelWidth, MapRule, MonteCarloConfig, NullStrategy,
    OutOfBoundsPolicy, SphereDensity, StudyWeighting,
};
pub use correct::Corrector;
pub use diagnostics::{ContributionTable, Diagnostic};
pub use error::{ConfigError, FailureReason, FitFailure, MetaError, Result};
pub use kernel::{ModeledActivationMap, PreparedStudy, SpatialKernelTransformer, Stencil};
pub use mask::{Affine, Mask};
pub use montecarlo::CancelToken;
pub use null::{
    ClusterNull, MaxStatNull, NullDistribution, NullDistributionEngine, PerVoxelNull, SharedNull,
    StudyGroup, StudySet, VoxelNull,
};
pub use regression::{
    CountModel, FitState, FoldFit, OptimizerBackend, RegressionConfig, RegressionData,
    RegressionEstimator, RegressionFit, SpatialBasis, WaldTest,
};
pub use results::{CorrectedResult, GroupStatisticMap, MetaResult, Tail};
pub use study::{focus_filter, Focus, Study, StudyData};
pub use workflow::{cbma_workflow, MetaAnalysis, WorkflowResult};
