use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use statrs::function::gamma::{digamma, ln_gamma};

/// Count process for the number of foci per study and voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountModel {
    /// `y_ij ~ Poisson(mu_j * mu_i)`.
    #[default]
    Poisson,
    /// Foci allocated over voxels multinomially, study totals negative
    /// binomial (NB2) with an estimated dispersion.
    NegativeBinomial,
}
impl CountModel {
    pub fn label(&self) -> &'static str {
        match self {
            CountModel::Poisson => "poisson",
            CountModel::NegativeBinomial => "negative-binomial",
        }
    }
}

/// Log-likelihood of one model over a fixed design.
///
/// Parameters are packed as `[beta (spatial), gamma (covariates), log(alpha)]`,
/// the last entry only for the negative binomial model.
pub(crate) struct Likelihood<'a> {
    pub x: &'a Array2<f64>,
    pub z: &'a Array2<f64>,
    /// Foci per voxel, summed over studies.
    pub y: &'a Array1<f64>,
    /// Foci per study.
    pub n: &'a Array1<f64>,
    pub model: CountModel,
}

struct Terms {
    mu: Array1<f64>,
    mu_z: Array1<f64>,
    log_alpha: Option<f64>,
}

impl<'a> Likelihood<'a> {
    pub fn n_spatial(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_covariates(&self) -> usize {
        self.z.ncols()
    }

    pub fn n_params(&self) -> usize {
        let extra = match self.model {
            CountModel::Poisson => 0,
            CountModel::NegativeBinomial => 1,
        };
        self.n_spatial() + self.n_covariates() + extra
    }

    /// Starting point: a flat intensity matching the observed total, no
    /// covariate effect, and a moment estimate of the dispersion.
    pub fn initial(&self) -> Array1<f64> {
        let n_voxels = self.x.nrows() as f64;
        let n_studies = self.n.len() as f64;
        let total = self.y.sum().max(1.0);
        // exact only when the basis rows sum to one
        let row_sum = self.x.sum_axis(Axis(1)).mean().unwrap_or(1.0).max(f64::EPSILON);
        let level = (total / (n_voxels * n_studies)).ln() / row_sum;

        let mut theta = Array1::zeros(self.n_params());
        theta.slice_mut(s![..self.n_spatial()]).fill(level);
        if self.model == CountModel::NegativeBinomial {
            let mean = self.n.mean().unwrap_or(1.0).max(f64::EPSILON);
            let variance = self.n.var(1.0);
            let alpha = ((variance - mean) / (mean * mean)).max(1e-2);
            theta[self.n_params() - 1] = alpha.ln();
        }
        theta
    }

    fn terms(&self, theta: &Array1<f64>) -> Terms {
        let p = self.n_spatial();
        let q = self.n_covariates();
        let beta = theta.slice(s![..p]);
        let gamma = theta.slice(s![p..p + q]);
        Terms {
            mu: self.x.dot(&beta).mapv(f64::exp),
            mu_z: self.z.dot(&gamma).mapv(f64::exp),
            log_alpha: (self.model == CountModel::NegativeBinomial).then(|| theta[p + q]),
        }
    }

    pub fn log_likelihood(&self, theta: &Array1<f64>) -> f64 {
        let t = self.terms(theta);
        let sum_mu = t.mu.sum();
        let spatial = self.y.dot(&t.mu.mapv(f64::ln));
        match t.log_alpha {
            None => spatial + self.n.dot(&t.mu_z.mapv(f64::ln)) - sum_mu * t.mu_z.sum(),
            Some(log_alpha) => {
                let r = (-log_alpha).exp();
                let allocation = spatial - self.y.sum() * sum_mu.ln();
                let totals = self
                    .n
                    .iter()
                    .zip(t.mu_z.iter())
                    .map(|(n, mz)| nb_log_pmf(*n, mz * sum_mu, r))
                    .sum::<f64>();
                allocation + totals
            }
        }
    }

    pub fn gradient(&self, theta: &Array1<f64>) -> Array1<f64> {
        let t = self.terms(theta);
        let p = self.n_spatial();
        let q = self.n_covariates();
        let sum_mu = t.mu.sum();
        let mut grad = Array1::zeros(self.n_params());

        match t.log_alpha {
            None => {
                let sum_mu_z = t.mu_z.sum();
                let spatial_residual = self.y - &(&t.mu * sum_mu_z);
                let study_residual = self.n - &(&t.mu_z * sum_mu);
                grad.slice_mut(s![..p]).assign(&self.x.t().dot(&spatial_residual));
                grad.slice_mut(s![p..p + q])
                    .assign(&self.z.t().dot(&study_residual));
            }
            Some(log_alpha) => {
                let r = (-log_alpha).exp();
                let mean = &t.mu_z * sum_mu;
                // d l / d log(m_i)
                let scores = self
                    .n
                    .iter()
                    .zip(mean.iter())
                    .map(|(n, m)| r * (n - m) / (r + m))
                    .collect::<Array1<f64>>();
                let total = self.y.sum();
                let scale = (total - scores.sum()) / sum_mu;
                let spatial_residual = self.y - &(&t.mu * scale);
                grad.slice_mut(s![..p]).assign(&self.x.t().dot(&spatial_residual));
                grad.slice_mut(s![p..p + q]).assign(&self.z.t().dot(&scores));
                let d_r = self
                    .n
                    .iter()
                    .zip(mean.iter())
                    .map(|(n, m)| {
                        digamma(n + r) - digamma(r) + (r / (r + m)).ln() + 1.0 - (r + n) / (r + m)
                    })
                    .sum::<f64>();
                grad[p + q] = -r * d_r;
            }
        }
        grad
    }

    /// Analytic for the Poisson model, central differences of the gradient
    /// otherwise.
    pub fn hessian(&self, theta: &Array1<f64>) -> Array2<f64> {
        match self.model {
            CountModel::Poisson => self.poisson_hessian(theta),
            CountModel::NegativeBinomial => self.numerical_hessian(theta),
        }
    }

    fn poisson_hessian(&self, theta: &Array1<f64>) -> Array2<f64> {
        let t = self.terms(theta);
        let p = self.n_spatial();
        let q = self.n_covariates();
        let sum_mu = t.mu.sum();
        let sum_mu_z = t.mu_z.sum();

        let mut hessian = Array2::zeros((p + q, p + q));
        hessian
            .slice_mut(s![..p, ..p])
            .assign(&(weighted_gram(self.x, t.mu.view()) * -sum_mu_z));
        hessian
            .slice_mut(s![p.., p..])
            .assign(&(weighted_gram(self.z, t.mu_z.view()) * -sum_mu));
        let cross = outer(&self.x.t().dot(&t.mu), &self.z.t().dot(&t.mu_z)) * -1.0;
        hessian.slice_mut(s![..p, p..]).assign(&cross);
        hessian.slice_mut(s![p.., ..p]).assign(&cross.t());
        hessian
    }

    fn numerical_hessian(&self, theta: &Array1<f64>) -> Array2<f64> {
        let k = theta.len();
        let mut hessian = Array2::zeros((k, k));
        for col in 0..k {
            let h = 1e-5 * theta[col].abs().max(1.0);
            let mut forward = theta.clone();
            let mut backward = theta.clone();
            forward[col] += h;
            backward[col] -= h;
            let diff = (self.gradient(&forward) - self.gradient(&backward)) / (2.0 * h);
            hessian.column_mut(col).assign(&diff);
        }
        (&hessian + &hessian.t()) * 0.5
    }

    /// Expected foci per voxel for one study with average covariate effect.
    pub fn intensity(&self, theta: &Array1<f64>) -> Array1<f64> {
        let t = self.terms(theta);
        let study_scale = t.mu_z.mean().unwrap_or(1.0);
        t.mu * study_scale
    }
}

/// `X^T diag(w) X`
fn weighted_gram(x: &Array2<f64>, w: ArrayView1<f64>) -> Array2<f64> {
    let weighted = x * &w.insert_axis(Axis(1));
    x.t().dot(&weighted)
}

fn outer(a: &Array1<f64>, b: &Array1<f64>) -> Array2<f64> {
    a.view()
        .insert_axis(Axis(1))
        .dot(&b.view().insert_axis(Axis(0)))
}

/// NB2 log-probability of `n` with mean `m` and shape `r = 1 / alpha`.
fn nb_log_pmf(n: f64, m: f64, r: f64) -> f64 {
    ln_gamma(n + r) - ln_gamma(r) - ln_gamma(n + 1.0) + r * (r / (r + m)).ln()
        + n * (m / (r + m)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn design() -> (Array2<f64>, Array2<f64>, Array1<f64>, Array1<f64>) {
        let x = array![[1.0, 0.0], [0.5, 0.5], [0.0, 1.0], [0.25, 0.75]];
        let z = array![[0.3], [-0.6], [0.9]];
        let y = array![3.0, 1.0, 0.0, 4.0];
        let n = array![2.0, 1.0, 5.0];
        (x, z, y, n)
    }

    fn check_gradient(model: CountModel) {
        let (x, z, y, n) = design();
        let likelihood = Likelihood {
            x: &x,
            z: &z,
            y: &y,
            n: &n,
            model,
        };
        let mut theta = likelihood.initial();
        theta[0] += 0.2;
        theta[2] = 0.4;
        let analytic = likelihood.gradient(&theta);
        for k in 0..theta.len() {
            let h = 1e-6;
            let mut forward = theta.clone();
            let mut backward = theta.clone();
            forward[k] += h;
            backward[k] -= h;
            let numeric = (likelihood.log_likelihood(&forward)
                - likelihood.log_likelihood(&backward))
                / (2.0 * h);
            assert_relative_eq!(analytic[k], numeric, epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_poisson_gradient_matches_finite_differences() {
        check_gradient(CountModel::Poisson);
    }

    #[test]
    fn test_negative_binomial_gradient_matches_finite_differences() {
        check_gradient(CountModel::NegativeBinomial);
    }

    #[test]
    fn test_poisson_hessian_symmetric_and_matches_gradient() {
        let (x, z, y, n) = design();
        let likelihood = Likelihood {
            x: &x,
            z: &z,
            y: &y,
            n: &n,
            model: CountModel::Poisson,
        };
        let theta = array![-1.2, -0.8, 0.5];
        let analytic = likelihood.poisson_hessian(&theta);
        let numeric = likelihood.numerical_hessian(&theta);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(analytic[[i, j]], analytic[[j, i]]);
                assert_relative_eq!(analytic[[i, j]], numeric[[i, j]], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_initial_matches_observed_total() {
        let (x, z, y, n) = design();
        let likelihood = Likelihood {
            x: &x,
            z: &z,
            y: &y,
            n: &n,
            model: CountModel::Poisson,
        };
        let theta = likelihood.initial();
        let expected = likelihood.intensity(&theta).sum() * n.len() as f64;
        assert_relative_eq!(expected, y.sum(), max_relative = 1e-12);
    }
}
