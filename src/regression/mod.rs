//! Coordinate-based meta-regression.
//!
//! Foci counts are modelled directly as a count process whose log-intensity is
//! a smooth spatial term plus linear study-level covariate effects.

mod basis;
mod model;
mod optimizer;

use std::time::Duration;

use bon::Builder;
use derive_new::new;
use ndarray::{s, Array1, Array2};
use rayon::prelude::*;
use tracing::{info, warn};

pub use basis::SpatialBasis;
pub use model::CountModel;
pub use optimizer::OptimizerBackend;

use model::Likelihood;
use optimizer::{maximize, Controls, Optimum};

use crate::{
    config::OutOfBoundsPolicy,
    error::{ConfigError, MetaError, Result},
    mask::Mask,
    math::normal_sf,
    montecarlo::worker_pool,
    null::{NullDistribution, SharedNull},
    results::{GroupStatisticMap, Tail},
    study::{Study, StudyData},
};

#[derive(Debug, Clone, Builder)]
pub struct RegressionConfig {
    #[builder(default)]
    pub model: CountModel,
    #[builder(default)]
    pub backend: OptimizerBackend,
    /// Knot spacing of the B-spline basis, in voxels.
    #[builder(default = 10)]
    pub spline_spacing: usize,
    #[builder(default = 200)]
    pub max_iterations: usize,
    /// Convergence on the largest absolute gradient entry.
    #[builder(default = 1e-4)]
    pub gradient_tolerance: f64,
    /// Convergence on the relative change of the log-likelihood.
    #[builder(default = 1e-10)]
    pub relative_tolerance: f64,
    pub timeout: Option<Duration>,
    /// Refit as Poisson when a negative binomial fit fails.
    #[builder(default = false)]
    pub fallback_to_poisson: bool,
    #[builder(default)]
    pub out_of_bounds: OutOfBoundsPolicy,
    /// Threads for cross-validation folds; rayon's default when unset.
    pub n_workers: Option<usize>,
}
impl RegressionConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.spline_spacing == 0 {
            return Err(ConfigError::OutOfRange {
                field: "spline_spacing",
                expected: "at least 1 voxel",
                value: 0.0,
            });
        }
        if self.n_workers == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "n_workers",
                expected: "at least 1",
                value: 0.0,
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_iterations",
                expected: "at least 1",
                value: 0.0,
            });
        }
        for (field, value) in [
            ("gradient_tolerance", self.gradient_tolerance),
            ("relative_tolerance", self.relative_tolerance),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::OutOfRange {
                    field,
                    expected: "finite and non-negative",
                    value,
                });
            }
        }
        if self.fallback_to_poisson && self.model == CountModel::Poisson {
            return Err(ConfigError::Incompatible(
                "fallback_to_poisson only applies to the negative binomial model".to_string(),
            ));
        }
        Ok(())
    }

    fn controls(&self) -> Controls {
        Controls {
            max_iterations: self.max_iterations,
            gradient_tolerance: self.gradient_tolerance,
            relative_tolerance: self.relative_tolerance,
            timeout: self.timeout,
        }
    }
}

/// Foci counts and covariates of a set of coordinate studies.
#[derive(Debug, Clone)]
pub struct RegressionData {
    study_ids: Vec<String>,
    /// Mask positions of each study's foci.
    study_foci: Vec<Vec<usize>>,
    /// One row per study, no intercept column.
    covariates: Array2<f64>,
    n_voxels: usize,
}
impl RegressionData {
    pub fn from_studies(mask: &Mask, studies: &[Study], policy: OutOfBoundsPolicy) -> Result<Self> {
        if studies.len() < 2 {
            return Err(MetaError::input(
                "studies",
                format!("meta-regression needs at least 2 studies, got {}", studies.len()),
            ));
        }
        let n_covariates = studies[0].covariates.len();
        let mut covariates = Array2::zeros((studies.len(), n_covariates));
        let mut study_foci = Vec::with_capacity(studies.len());

        for (row, study) in studies.iter().enumerate() {
            let StudyData::Coordinates(foci) = &study.data else {
                return Err(MetaError::input(&study.id, "meta-regression needs coordinates"));
            };
            if study.covariates.len() != n_covariates {
                return Err(MetaError::input(
                    &study.id,
                    format!(
                        "{} covariates, expected {n_covariates}",
                        study.covariates.len()
                    ),
                ));
            }
            if study.covariates.iter().any(|v| !v.is_finite()) {
                return Err(MetaError::input(&study.id, "non-finite covariate"));
            }
            covariates
                .row_mut(row)
                .assign(&Array1::from(study.covariates.clone()));

            let mut positions = Vec::with_capacity(foci.len());
            for (index, focus) in foci.iter().enumerate() {
                if focus.xyz.iter().any(|c| !c.is_finite()) {
                    return Err(MetaError::input(
                        &study.id,
                        format!("focus {index} has non-finite coordinates"),
                    ));
                }
                match (mask.position(mask.world_to_voxel(focus.xyz)), policy) {
                    (Some(position), _) => positions.push(position),
                    (None, OutOfBoundsPolicy::Drop) => {
                        warn!(study = %study.id, focus = index, "dropping focus outside the mask")
                    }
                    (None, OutOfBoundsPolicy::Reject) => {
                        return Err(MetaError::input(
                            &study.id,
                            format!("focus {index} at {:?} lies outside the mask", focus.xyz),
                        ))
                    }
                }
            }
            if positions.is_empty() {
                return Err(MetaError::input(&study.id, "no foci inside the mask"));
            }
            study_foci.push(positions);
        }

        Ok(Self {
            study_ids: studies.iter().map(|s| s.id.clone()).collect(),
            study_foci,
            covariates,
            n_voxels: mask.n_voxels(),
        })
    }

    pub fn n_studies(&self) -> usize {
        self.study_ids.len()
    }

    pub fn n_covariates(&self) -> usize {
        self.covariates.ncols()
    }

    pub fn study_ids(&self) -> &[String] {
        &self.study_ids
    }

    pub fn covariates(&self) -> &Array2<f64> {
        &self.covariates
    }

    /// Foci per voxel, summed over studies.
    pub fn voxel_counts(&self) -> Array1<f64> {
        let mut counts = Array1::zeros(self.n_voxels);
        for position in self.study_foci.iter().flatten() {
            counts[*position] += 1.0;
        }
        counts
    }

    /// Foci per study.
    pub fn study_counts(&self) -> Array1<f64> {
        self.study_foci.iter().map(|f| f.len() as f64).collect()
    }

    /// The studies at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            study_ids: indices.iter().map(|i| self.study_ids[*i].clone()).collect(),
            study_foci: indices.iter().map(|i| self.study_foci[*i].clone()).collect(),
            covariates: self.covariates.select(ndarray::Axis(0), indices),
            n_voxels: self.n_voxels,
        }
    }
}

/// Lifecycle of a [`RegressionEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitState {
    Unfit,
    Fitting,
    Fit,
    Failed,
}

/// Wald test of a single coefficient.
#[derive(new, Debug, Clone, Copy, PartialEq)]
pub struct WaldTest {
    pub index: usize,
    pub estimate: f64,
    pub standard_error: f64,
    pub z: f64,
    /// Two-sided.
    pub pvalue: f64,
}

#[derive(Debug, Clone)]
pub struct RegressionFit {
    pub model: CountModel,
    pub spatial_coefficients: Array1<f64>,
    pub spatial_standard_errors: Array1<f64>,
    pub covariate_coefficients: Array1<f64>,
    pub covariate_standard_errors: Array1<f64>,
    /// Full parameter covariance, when the backend provides one.
    pub covariance: Option<Array2<f64>>,
    /// Expected foci per voxel for a study at the average covariate effect.
    pub intensity: Array1<f64>,
    /// Variance of the fitted log-intensity at each voxel.
    pub log_intensity_variance: Array1<f64>,
    /// Negative binomial dispersion `alpha`.
    pub dispersion: Option<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    theta: Array1<f64>,
}
impl RegressionFit {
    pub fn covariate_tests(&self) -> Vec<WaldTest> {
        self.covariate_coefficients
            .iter()
            .zip(self.covariate_standard_errors.iter())
            .enumerate()
            .map(|(index, (estimate, se))| {
                let z = if *se > 0.0 { estimate / se } else { 0.0 };
                WaldTest::new(index, *estimate, *se, z, (2.0 * normal_sf(z.abs())).min(1.0))
            })
            .collect()
    }

    /// Voxel-wise Wald z of the log-intensity against its spatial mean.
    ///
    /// The null is standard normal and shared by all voxels, so the result can
    /// go straight to the corrector.
    pub fn homogeneity_test(&self) -> (GroupStatisticMap, NullDistribution) {
        let log_mean = self.intensity.mean().unwrap_or(0.0).ln();
        let z = self
            .intensity
            .iter()
            .zip(self.log_intensity_variance.iter())
            .map(|(mu, var)| {
                if *var > 0.0 {
                    (mu.ln() - log_mean) / var.sqrt()
                } else {
                    0.0
                }
            })
            .collect();
        (
            GroupStatisticMap::new(z, Tail::TwoSided),
            NullDistribution::parametric(SharedNull::StandardNormal, Tail::TwoSided),
        )
    }
}

/// Out-of-sample evaluation of one cross-validation fold.
#[derive(Debug, Clone)]
pub struct FoldFit {
    pub fold: usize,
    pub held_out: Vec<String>,
    pub fit: RegressionFit,
    /// Log-likelihood of the held-out studies under the training fit.
    pub held_out_log_likelihood: f64,
}

/// Maximum-likelihood fit of a count model to foci data.
#[derive(Debug, Clone)]
pub struct RegressionEstimator {
    config: RegressionConfig,
    state: FitState,
    fit: Option<RegressionFit>,
}
impl RegressionEstimator {
    /// Validates the configuration and checks the optimizer backend is
    /// compiled in.
    pub fn new(config: RegressionConfig) -> Result<Self> {
        config.validate()?;
        config.backend.probe()?;
        Ok(Self {
            config,
            state: FitState::Unfit,
            fit: None,
        })
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn result(&self) -> Option<&RegressionFit> {
        self.fit.as_ref()
    }

    /// Builds the data and B-spline basis from studies, then fits.
    pub fn fit(&mut self, mask: &Mask, studies: &[Study]) -> Result<&RegressionFit> {
        let data = RegressionData::from_studies(mask, studies, self.config.out_of_bounds)?;
        let basis = SpatialBasis::bspline(mask, self.config.spline_spacing)?;
        self.fit_data(&data, &basis)
    }

    pub fn fit_data(
        &mut self,
        data: &RegressionData,
        basis: &SpatialBasis,
    ) -> Result<&RegressionFit> {
        self.state = FitState::Fitting;
        self.fit = None;
        info!(
            model = self.config.model.label(),
            backend = self.config.backend.label(),
            n_studies = data.n_studies(),
            n_bases = basis.n_bases(),
            "Fitting meta-regression..."
        );
        match self.solve(data, basis) {
            Ok(fit) => {
                info!(
                    log_likelihood = fit.log_likelihood,
                    iterations = fit.iterations,
                    "meta-regression converged"
                );
                self.state = FitState::Fit;
                Ok(self.fit.insert(fit))
            }
            Err(err) => {
                self.state = FitState::Failed;
                Err(err)
            }
        }
    }

    /// Fits each of `k` folds on the remaining studies, in parallel.
    ///
    /// Study `i` is held out in fold `i % k`. Does not change the estimator's
    /// own state.
    pub fn fit_folds(
        &self,
        data: &RegressionData,
        basis: &SpatialBasis,
        k: usize,
    ) -> Result<Vec<FoldFit>> {
        if k < 2 || k > data.n_studies() {
            return Err(ConfigError::OutOfRange {
                field: "folds",
                expected: "between 2 and the number of studies",
                value: k as f64,
            }
            .into());
        }
        info!(folds = k, "Cross-validating meta-regression...");
        let pool = worker_pool(self.config.n_workers)?;
        pool.install(|| {
            (0..k)
                .into_par_iter()
                .map(|fold| -> Result<FoldFit> {
                    let (test, train): (Vec<usize>, Vec<usize>) =
                        (0..data.n_studies()).partition(|i| i % k == fold);
                    let train_data = data.subset(&train);
                    let test_data = data.subset(&test);
                    let fit = self.solve(&train_data, basis)?;

                    let y = test_data.voxel_counts();
                    let n = test_data.study_counts();
                    let likelihood = Likelihood {
                        x: basis.matrix(),
                        z: test_data.covariates(),
                        y: &y,
                        n: &n,
                        model: fit.model,
                    };
                    Ok(FoldFit {
                        fold,
                        held_out: test_data.study_ids().to_vec(),
                        held_out_log_likelihood: likelihood.log_likelihood(&fit.theta),
                        fit,
                    })
                })
                .collect()
        })
    }

    fn solve(&self, data: &RegressionData, basis: &SpatialBasis) -> Result<RegressionFit> {
        match (self.optimize(data, basis, self.config.model), self.config.model) {
            (Err(MetaError::Numerical(failure)), CountModel::NegativeBinomial)
                if self.config.fallback_to_poisson =>
            {
                warn!(%failure, "negative binomial fit failed, refitting as Poisson");
                self.optimize(data, basis, CountModel::Poisson)
            }
            (result, _) => result,
        }
    }

    fn optimize(
        &self,
        data: &RegressionData,
        basis: &SpatialBasis,
        model: CountModel,
    ) -> Result<RegressionFit> {
        if basis.matrix().nrows() != data.n_voxels {
            return Err(MetaError::input(
                "basis",
                format!(
                    "basis has {} rows but the data covers {} voxels",
                    basis.matrix().nrows(),
                    data.n_voxels
                ),
            ));
        }
        let y = data.voxel_counts();
        let n = data.study_counts();
        let likelihood = Likelihood {
            x: basis.matrix(),
            z: data.covariates(),
            y: &y,
            n: &n,
            model,
        };
        let optimum = maximize(
            &likelihood,
            likelihood.initial(),
            self.config.backend,
            self.config.controls(),
        )?;
        Ok(assemble(&likelihood, optimum))
    }
}

fn assemble(likelihood: &Likelihood, optimum: Optimum) -> RegressionFit {
    let p = likelihood.n_spatial();
    let q = likelihood.n_covariates();
    let theta = optimum.theta;

    // the diagonal approximation ignores correlation between parameters
    let variances = match &optimum.covariance {
        Some(covariance) => covariance.diag().to_owned(),
        None => optimum
            .hessian
            .diag()
            .mapv(|h| if h < 0.0 { -1.0 / h } else { f64::NAN }),
    };
    let standard_errors = variances.mapv(f64::sqrt);

    let x = likelihood.x;
    let log_intensity_variance = match &optimum.covariance {
        Some(covariance) => {
            let spatial = covariance.slice(s![..p, ..p]);
            let projected = x.dot(&spatial);
            (&projected * x).sum_axis(ndarray::Axis(1))
        }
        None => x
            .mapv(|v| v * v)
            .dot(&variances.slice(s![..p])),
    };

    RegressionFit {
        model: likelihood.model,
        spatial_coefficients: theta.slice(s![..p]).to_owned(),
        spatial_standard_errors: standard_errors.slice(s![..p]).to_owned(),
        covariate_coefficients: theta.slice(s![p..p + q]).to_owned(),
        covariate_standard_errors: standard_errors.slice(s![p..p + q]).to_owned(),
        covariance: optimum.covariance,
        intensity: likelihood.intensity(&theta),
        log_intensity_variance,
        dispersion: (likelihood.model == CountModel::NegativeBinomial).then(|| theta[p + q].exp()),
        log_likelihood: optimum.log_likelihood,
        iterations: optimum.iterations,
        theta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mask::Affine, study::Focus};
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Gamma, Poisson};

    /// Studies with `n_i ~ Poisson(exp(gamma * z_i) * total_rate)` foci placed
    /// uniformly over the mask.
    fn synthetic(mask: &Mask, n_studies: usize, gamma: f64, rate: f64, seed: u64) -> Vec<Study> {
        generate(mask, n_studies, gamma, rate, None, seed)
    }

    /// As [`synthetic`], with study rates drawn from a gamma distribution of
    /// mean 1 and variance `alpha`, so study totals are negative binomial.
    fn overdispersed(
        mask: &Mask,
        n_studies: usize,
        gamma: f64,
        rate: f64,
        alpha: f64,
        seed: u64,
    ) -> Vec<Study> {
        generate(mask, n_studies, gamma, rate, Some(alpha), seed)
    }

    fn generate(
        mask: &Mask,
        n_studies: usize,
        gamma: f64,
        rate: f64,
        alpha: Option<f64>,
        seed: u64,
    ) -> Vec<Study> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let total_rate = rate * mask.n_voxels() as f64;
        (0..n_studies)
            .map(|i| {
                let z: f64 = rng.gen_range(-1.0..1.0);
                let frailty = match alpha {
                    Some(alpha) => Gamma::new(1.0 / alpha, alpha).unwrap().sample(&mut rng),
                    None => 1.0,
                };
                let lambda = (gamma * z).exp() * total_rate * frailty;
                let count = Poisson::new(lambda).unwrap().sample(&mut rng).max(1.0) as usize;
                let foci = (0..count)
                    .map(|_| {
                        let voxel = mask.ijk(rng.gen_range(0..mask.n_voxels()));
                        Focus::new(mask.voxel_to_world(voxel))
                    })
                    .collect();
                Study::coordinates(format!("study-{i}"), foci).with_covariates(vec![z])
            })
            .collect()
    }

    fn mask() -> Mask {
        Mask::full([8, 8, 8], Affine::isotropic(2.0, [0.0; 3]).unwrap()).unwrap()
    }

    #[test]
    fn test_poisson_recovers_covariate_effect() {
        let mask = mask();
        let studies = synthetic(&mask, 300, 0.8, 0.05, 3);
        let mut estimator = RegressionEstimator::new(
            RegressionConfig::builder()
                .spline_spacing(4)
                .backend(OptimizerBackend::default())
                .max_iterations(5_000)
                .build(),
        )
        .unwrap();
        assert_eq!(estimator.state(), FitState::Unfit);

        let fit = estimator.fit(&mask, &studies).unwrap();
        assert!((fit.covariate_coefficients[0] - 0.8).abs() < 0.1);
        assert!(fit.covariate_standard_errors[0] > 0.0);
        // the average study scales the flat 0.05 rate by E[exp(0.8 z)] = sinh(0.8) / 0.8
        let mean_intensity = fit.intensity.mean().unwrap();
        assert!((mean_intensity - 0.05 * 0.8_f64.sinh() / 0.8).abs() < 0.01);
        assert!(fit.covariate_tests()[0].pvalue < 1e-6);
        assert_eq!(estimator.state(), FitState::Fit);
    }

    #[test]
    fn test_covariate_error_shrinks_with_more_studies() {
        let mask = mask();
        let config = || {
            RegressionConfig::builder()
                .spline_spacing(8)
                .max_iterations(5_000)
                .build()
        };
        // mean absolute error and mean standard error over independent datasets
        let accuracy = |n_studies: usize| {
            let seeds = 0..8_u64;
            let (error, se) = seeds.clone().fold((0.0, 0.0), |(error, se), seed| {
                let studies = synthetic(&mask, n_studies, 0.8, 0.05, 100 + seed);
                let mut estimator = RegressionEstimator::new(config()).unwrap();
                let fit = estimator.fit(&mask, &studies).unwrap();
                (
                    error + (fit.covariate_coefficients[0] - 0.8).abs(),
                    se + fit.covariate_standard_errors[0],
                )
            });
            let n = seeds.count() as f64;
            (error / n, se / n)
        };
        let (small_error, small_se) = accuracy(20);
        let (large_error, large_se) = accuracy(500);
        assert!(large_error < small_error);
        assert!(large_se < 0.5 * small_se);
    }

    #[test]
    fn test_homogeneity_map_is_two_sided_standard_normal() {
        let mask = mask();
        let studies = synthetic(&mask, 60, 0.0, 0.05, 5);
        let mut estimator = RegressionEstimator::new(
            RegressionConfig::builder()
                .spline_spacing(4)
                .max_iterations(5_000)
                .build(),
        )
        .unwrap();
        let fit = estimator.fit(&mask, &studies).unwrap();
        let (stat, null) = fit.homogeneity_test();
        assert_eq!(stat.n_voxels(), mask.n_voxels());
        assert_eq!(stat.tail, Tail::TwoSided);
        assert!(stat.values.iter().all(|z| z.is_finite()));
        assert!(matches!(
            null.voxel,
            crate::null::VoxelNull::Shared(SharedNull::StandardNormal)
        ));
    }

    #[test]
    fn test_failed_fit_sets_failed_state() {
        let mask = mask();
        let studies = synthetic(&mask, 20, 0.5, 0.05, 9);
        let mut estimator = RegressionEstimator::new(
            RegressionConfig::builder()
                .spline_spacing(4)
                .max_iterations(1)
                .gradient_tolerance(0.0)
                .relative_tolerance(0.0)
                .build(),
        )
        .unwrap();
        let result = estimator.fit(&mask, &studies);
        assert!(matches!(result, Err(MetaError::Numerical(_))));
        assert_eq!(estimator.state(), FitState::Failed);
        assert!(estimator.result().is_none());
    }

    #[test]
    fn test_negative_binomial_estimates_dispersion() {
        let mask = mask();
        let studies = overdispersed(&mask, 120, 0.3, 0.05, 1.0, 13);
        let mut estimator = RegressionEstimator::new(
            RegressionConfig::builder()
                .model(CountModel::NegativeBinomial)
                .spline_spacing(8)
                .max_iterations(5_000)
                .fallback_to_poisson(false)
                .build(),
        )
        .unwrap();
        let fit = estimator.fit(&mask, &studies).unwrap();
        assert_eq!(fit.model, CountModel::NegativeBinomial);
        assert!(fit.log_likelihood.is_finite());
        let dispersion = fit.dispersion.unwrap();
        assert!(dispersion > 0.3 && dispersion < 3.0, "dispersion {dispersion}");
        assert_eq!(estimator.state(), FitState::Fit);
    }

    #[test]
    fn test_negative_binomial_falls_back_on_equidispersed_counts() {
        let mask = mask();
        let studies = synthetic(&mask, 80, 0.3, 0.05, 13);
        let config = |fallback_to_poisson| {
            RegressionConfig::builder()
                .model(CountModel::NegativeBinomial)
                .spline_spacing(8)
                .max_iterations(5_000)
                .fallback_to_poisson(fallback_to_poisson)
                .build()
        };

        let mut strict = RegressionEstimator::new(config(false)).unwrap();
        assert!(matches!(
            strict.fit(&mask, &studies),
            Err(MetaError::Numerical(_))
        ));
        assert_eq!(strict.state(), FitState::Failed);

        let mut lenient = RegressionEstimator::new(config(true)).unwrap();
        let fit = lenient.fit(&mask, &studies).unwrap();
        assert_eq!(fit.model, CountModel::Poisson);
        assert!(fit.dispersion.is_none());
        assert_eq!(lenient.state(), FitState::Fit);
    }

    #[test]
    fn test_fit_folds_hold_out_every_study_once() {
        let mask = mask();
        let studies = synthetic(&mask, 30, 0.5, 0.05, 17);
        let estimator = RegressionEstimator::new(
            RegressionConfig::builder()
                .spline_spacing(8)
                .max_iterations(5_000)
                .n_workers(2)
                .build(),
        )
        .unwrap();
        let data = RegressionData::from_studies(&mask, &studies, OutOfBoundsPolicy::Reject)
            .unwrap();
        let basis = SpatialBasis::bspline(&mask, 8).unwrap();
        let folds = estimator.fit_folds(&data, &basis, 3).unwrap();
        assert_eq!(folds.len(), 3);
        let held_out = folds.iter().map(|f| f.held_out.len()).sum::<usize>();
        assert_eq!(held_out, 30);
        assert!(folds.iter().all(|f| f.held_out_log_likelihood.is_finite()));
        assert_eq!(estimator.state(), FitState::Unfit);
    }

    #[test]
    fn test_config_and_data_validation() {
        let bad = RegressionConfig::builder().spline_spacing(0).build();
        assert!(matches!(
            RegressionEstimator::new(bad),
            Err(MetaError::Configuration(_))
        ));
        let no_workers = RegressionConfig::builder().n_workers(0).build();
        assert!(matches!(
            RegressionEstimator::new(no_workers),
            Err(MetaError::Configuration(ConfigError::OutOfRange { field: "n_workers", .. }))
        ));
        let mask = mask();
        let studies = vec![
            Study::coordinates("a", vec![Focus::new([0.0, 0.0, 0.0])]).with_covariates(vec![1.0]),
            Study::coordinates("b", vec![Focus::new([2.0, 0.0, 0.0])]),
        ];
        assert!(matches!(
            RegressionData::from_studies(&mask, &studies, OutOfBoundsPolicy::Reject),
            Err(MetaError::InputData { .. })
        ));
    }

    #[test]
    fn test_subset_keeps_counts() {
        let mask = mask();
        let studies = synthetic(&mask, 6, 0.0, 0.05, 1);
        let data = RegressionData::from_studies(&mask, &studies, OutOfBoundsPolicy::Reject)
            .unwrap();
        let subset = data.subset(&[0, 2]);
        assert_eq!(subset.n_studies(), 2);
        assert_relative_eq!(
            subset.voxel_counts().sum(),
            subset.study_counts().sum()
        );
        assert_eq!(subset.covariates().row(1)[0], data.covariates().row(2)[0]);
    }
}
