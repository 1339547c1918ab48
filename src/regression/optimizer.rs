use std::time::{Duration, Instant};

use ndarray::{Array1, Array2};
use tracing::debug;

use super::model::Likelihood;
use crate::error::{FailureReason, FitFailure, MetaError, Result};

/// Numerical maximiser of the regression log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerBackend {
    /// Damped Newton steps with Cholesky solves. Needs the `nalgebra` feature.
    Newton,
    /// Diagonally preconditioned gradient ascent with Armijo backtracking.
    GradientAscent,
}
impl Default for OptimizerBackend {
    fn default() -> Self {
        if cfg!(feature = "nalgebra") {
            OptimizerBackend::Newton
        } else {
            OptimizerBackend::GradientAscent
        }
    }
}
impl OptimizerBackend {
    pub fn label(&self) -> &'static str {
        match self {
            OptimizerBackend::Newton => "newton",
            OptimizerBackend::GradientAscent => "gradient-ascent",
        }
    }

    /// Cargo feature the backend depends on, if any.
    pub fn required_feature(&self) -> Option<&'static str> {
        match self {
            OptimizerBackend::Newton => Some("nalgebra"),
            OptimizerBackend::GradientAscent => None,
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            OptimizerBackend::Newton => cfg!(feature = "nalgebra"),
            OptimizerBackend::GradientAscent => true,
        }
    }

    /// Fails with [`MetaError::DependencyUnavailable`] when the backend was
    /// compiled out.
    pub fn probe(&self) -> Result<()> {
        match (self.is_available(), self.required_feature()) {
            (false, Some(feature)) => Err(MetaError::DependencyUnavailable {
                backend: self.label(),
                feature,
            }),
            _ => Ok(()),
        }
    }
}

/// Stopping rules shared by every backend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Controls {
    pub max_iterations: usize,
    pub gradient_tolerance: f64,
    pub relative_tolerance: f64,
    pub timeout: Option<Duration>,
}

/// A converged maximum.
#[derive(Debug, Clone)]
pub(crate) struct Optimum {
    pub theta: Array1<f64>,
    pub log_likelihood: f64,
    pub hessian: Array2<f64>,
    /// Inverse of the negative Hessian, when the backend factorises it.
    pub covariance: Option<Array2<f64>>,
    pub iterations: usize,
}

/// Search direction of one iteration.
struct Step {
    direction: Array1<f64>,
    /// Whether a full step is expected to be accepted.
    newton: bool,
}

const MAX_HALVINGS: usize = 40;
const ARMIJO: f64 = 1e-4;

pub(crate) fn maximize(
    likelihood: &Likelihood,
    theta: Array1<f64>,
    backend: OptimizerBackend,
    controls: Controls,
) -> Result<Optimum> {
    backend.probe()?;
    let started = Instant::now();
    let mut theta = theta;
    let mut value = likelihood.log_likelihood(&theta);

    for iteration in 0..controls.max_iterations {
        let gradient = likelihood.gradient(&theta);
        let criterion = gradient.iter().fold(0.0_f64, |acc, g| acc.max(g.abs()));
        let failure = |reason| FitFailure {
            reason,
            iterations: iteration,
            log_likelihood: value,
            criterion,
        };
        if !value.is_finite() || !criterion.is_finite() {
            return Err(failure(FailureReason::NonFinite).into());
        }
        if controls.timeout.is_some_and(|t| started.elapsed() >= t) {
            return Err(failure(FailureReason::Timeout).into());
        }

        let hessian = likelihood.hessian(&theta);
        if criterion <= controls.gradient_tolerance {
            return finish(backend, theta, value, hessian, iteration);
        }

        let step = match backend {
            OptimizerBackend::Newton => newton_direction(&hessian, &gradient),
            OptimizerBackend::GradientAscent => Some(preconditioned_direction(&hessian, &gradient)),
        }
        .ok_or_else(|| failure(FailureReason::SingularHessian))?;

        // backtracking line search
        let slope = gradient.dot(&step.direction);
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let candidate = &theta + &(&step.direction * scale);
            let candidate_value = likelihood.log_likelihood(&candidate);
            let required = if step.newton {
                value
            } else {
                value + ARMIJO * scale * slope
            };
            if candidate_value.is_finite() && candidate_value >= required {
                accepted = Some((candidate, candidate_value));
                break;
            }
            scale *= 0.5;
        }
        let Some((next, next_value)) = accepted else {
            return Err(failure(FailureReason::Divergence).into());
        };

        let change = (next_value - value).abs() / (value.abs() + 1.0);
        debug!(
            iteration,
            log_likelihood = next_value,
            criterion,
            step = scale,
            "optimizer step"
        );
        theta = next;
        value = next_value;
        if change <= controls.relative_tolerance {
            let hessian = likelihood.hessian(&theta);
            return finish(backend, theta, value, hessian, iteration + 1);
        }
    }

    let gradient = likelihood.gradient(&theta);
    Err(FitFailure {
        reason: FailureReason::MaxIterations,
        iterations: controls.max_iterations,
        log_likelihood: value,
        criterion: gradient.iter().fold(0.0_f64, |acc, g| acc.max(g.abs())),
    }
    .into())
}

fn finish(
    backend: OptimizerBackend,
    theta: Array1<f64>,
    log_likelihood: f64,
    hessian: Array2<f64>,
    iterations: usize,
) -> Result<Optimum> {
    let covariance = match backend {
        OptimizerBackend::Newton => Some(inverse_negative(&hessian).ok_or(FitFailure {
            reason: FailureReason::SingularHessian,
            iterations,
            log_likelihood,
            criterion: f64::NAN,
        })?),
        OptimizerBackend::GradientAscent => None,
    };
    Ok(Optimum {
        theta,
        log_likelihood,
        hessian,
        covariance,
        iterations,
    })
}

/// `g_k / -H_kk`, falling back to a unit scale where the curvature vanishes.
fn preconditioned_direction(hessian: &Array2<f64>, gradient: &Array1<f64>) -> Step {
    let direction = gradient
        .iter()
        .zip(hessian.diag().iter())
        .map(|(g, h)| if -h > f64::EPSILON { g / -h } else { *g })
        .collect();
    Step {
        direction,
        newton: false,
    }
}

#[cfg(feature = "nalgebra")]
mod dense {
    use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
    use ndarray::{Array1, Array2};

    /// Jitter multipliers tried, relative to the mean diagonal, before giving up.
    const JITTER: [f64; 5] = [0.0, 1e-10, 1e-8, 1e-6, 1e-4];

    /// Cholesky factor of `-H`, jittered onto the diagonal if needed.
    fn factor(hessian: &Array2<f64>) -> Option<Cholesky<f64, Dyn>> {
        let k = hessian.nrows();
        let scale = (0..k).map(|i| -hessian[[i, i]]).sum::<f64>().abs() / k.max(1) as f64;
        JITTER.iter().find_map(|jitter| {
            let matrix = DMatrix::from_fn(k, k, |i, j| {
                let diagonal = if i == j { jitter * scale.max(1.0) } else { 0.0 };
                -hessian[[i, j]] + diagonal
            });
            Cholesky::new(matrix)
        })
    }

    pub fn solve(hessian: &Array2<f64>, gradient: &Array1<f64>) -> Option<Array1<f64>> {
        let chol = factor(hessian)?;
        let rhs = DVector::from_iterator(gradient.len(), gradient.iter().copied());
        let solution = chol.solve(&rhs);
        Some(solution.iter().copied().collect())
    }

    pub fn inverse(hessian: &Array2<f64>) -> Option<Array2<f64>> {
        let k = hessian.nrows();
        let matrix = DMatrix::from_fn(k, k, |i, j| -hessian[[i, j]]);
        let inverse = Cholesky::new(matrix)?.inverse();
        Some(Array2::from_shape_fn((k, k), |(i, j)| inverse[(i, j)]))
    }
}

#[cfg(feature = "nalgebra")]
fn newton_direction(hessian: &Array2<f64>, gradient: &Array1<f64>) -> Option<Step> {
    dense::solve(hessian, gradient).map(|direction| Step {
        direction,
        newton: true,
    })
}

#[cfg(not(feature = "nalgebra"))]
fn newton_direction(_hessian: &Array2<f64>, _gradient: &Array1<f64>) -> Option<Step> {
    None
}

#[cfg(feature = "nalgebra")]
fn inverse_negative(hessian: &Array2<f64>) -> Option<Array2<f64>> {
    dense::inverse(hessian)
}

#[cfg(not(feature = "nalgebra"))]
fn inverse_negative(_hessian: &Array2<f64>) -> Option<Array2<f64>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::model::CountModel;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn controls() -> Controls {
        Controls {
            max_iterations: 5_000,
            gradient_tolerance: 1e-8,
            relative_tolerance: 0.0,
            timeout: None,
        }
    }

    /// Single spatial column and a single binary covariate: the maximum has a
    /// closed form.
    fn problem() -> (Array2<f64>, Array2<f64>, Array1<f64>, Array1<f64>) {
        let x = Array2::ones((4, 1));
        let z = array![[0.0], [0.0], [1.0], [1.0]];
        let y = array![5.0, 3.0, 4.0, 8.0];
        let n = array![2.0, 4.0, 7.0, 7.0];
        (x, z, y, n)
    }

    fn check(backend: OptimizerBackend) {
        let (x, z, y, n) = problem();
        let likelihood = Likelihood {
            x: &x,
            z: &z,
            y: &y,
            n: &n,
            model: CountModel::Poisson,
        };
        let optimum = maximize(&likelihood, likelihood.initial(), backend, controls()).unwrap();
        // exp(gamma) is the ratio of mean foci in the two covariate groups
        assert_relative_eq!(optimum.theta[1], (14.0_f64 / 6.0).ln(), epsilon = 1e-6);
        // 4 voxels * exp(beta) * (2 + 2 exp(gamma)) = 20
        let expected_beta = (20.0_f64 / (4.0 * (2.0 + 2.0 * 14.0 / 6.0))).ln();
        assert_relative_eq!(optimum.theta[0], expected_beta, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_ascent_reaches_closed_form() {
        check(OptimizerBackend::GradientAscent);
    }

    #[cfg(feature = "nalgebra")]
    #[test]
    fn test_newton_reaches_closed_form_with_covariance() {
        check(OptimizerBackend::Newton);
        let (x, z, y, n) = problem();
        let likelihood = Likelihood {
            x: &x,
            z: &z,
            y: &y,
            n: &n,
            model: CountModel::Poisson,
        };
        let optimum = maximize(
            &likelihood,
            likelihood.initial(),
            OptimizerBackend::Newton,
            controls(),
        )
        .unwrap();
        let covariance = optimum.covariance.unwrap();
        assert!(covariance[[1, 1]] > 0.0);
        assert!(optimum.iterations < 20);
    }

    #[cfg(not(feature = "nalgebra"))]
    #[test]
    fn test_newton_unavailable_without_feature() {
        assert!(matches!(
            OptimizerBackend::Newton.probe(),
            Err(MetaError::DependencyUnavailable { .. })
        ));
    }

    #[test]
    fn test_iteration_cap_reports_failure() {
        let (x, z, y, n) = problem();
        let likelihood = Likelihood {
            x: &x,
            z: &z,
            y: &y,
            n: &n,
            model: CountModel::Poisson,
        };
        let capped = Controls {
            max_iterations: 1,
            ..controls()
        };
        let result = maximize(
            &likelihood,
            likelihood.initial(),
            OptimizerBackend::GradientAscent,
            capped,
        );
        match result {
            Err(MetaError::Numerical(failure)) => {
                assert_eq!(failure.reason, FailureReason::MaxIterations);
                assert_eq!(failure.iterations, 1);
                assert!(failure.log_likelihood.is_finite());
            }
            other => panic!("expected an iteration failure, got {other:?}"),
        }
    }
}
