use std::fmt;

use thiserror::Error;

/// Errors raised by any stage of a meta-analysis or meta-regression run.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("invalid input in `{record}`: {reason}")]
    InputData { record: String, reason: String },

    #[error("numerical failure: {0}")]
    Numerical(#[from] FitFailure),

    #[error("optimizer backend `{backend}` is unavailable (enable the `{feature}` feature)")]
    DependencyUnavailable {
        backend: &'static str,
        feature: &'static str,
    },

    #[error("resampling was cancelled after {completed} of {requested} draws")]
    Cancelled { completed: usize, requested: usize },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl MetaError {
    pub fn input(record: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InputData {
            record: record.into(),
            reason: reason.into(),
        }
    }
}

/// Invalid or mutually inconsistent options, detected before any computation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("`{field}` must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: f64,
    },

    #[error("the empirical null requires at least one resample")]
    NoResamples,

    #[error(
        "{n_resamples} resamples cannot resolve p-values below {alpha} \
         (at least {required} are needed)"
    )]
    UnderpoweredResampling {
        n_resamples: usize,
        alpha: f64,
        required: usize,
    },

    #[error("{0} requires Monte-Carlo settings")]
    MissingMonteCarlo(&'static str),

    #[error("cluster-level correction requires a cluster-forming threshold")]
    MissingClusterThreshold,

    #[error("a p-value cluster-forming threshold requires a voxel-shared null distribution")]
    ClusterThresholdNeedsSharedNull,

    #[error("{0}")]
    Incompatible(String),
}

/// Why an iterative fit stopped without a usable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MaxIterations,
    SingularHessian,
    Divergence,
    NonFinite,
    Timeout,
    DegenerateNull,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::MaxIterations => "iteration cap reached before convergence",
            FailureReason::SingularHessian => "Hessian is singular or not negative definite",
            FailureReason::Divergence => "line search could not increase the log-likelihood",
            FailureReason::NonFinite => "log-likelihood or gradient became non-finite",
            FailureReason::Timeout => "timed out",
            FailureReason::DegenerateNull => "null distribution has zero variance",
        };
        f.write_str(label)
    }
}

/// Diagnostic record of a failed numerical procedure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "{reason} after {iterations} iterations \
     (log-likelihood {log_likelihood:.6}, criterion {criterion:.3e})"
)]
pub struct FitFailure {
    pub reason: FailureReason,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub criterion: f64,
}

pub type Result<T> = std::result::Result<T, MetaError>;
