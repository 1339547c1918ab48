use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

/// Smallest p-value reported by parametric nulls, keeping z-scores finite.
pub const MIN_PVALUE: f64 = 1e-300;

pub fn fwhm_to_sigma(fwhm: f64) -> f64 {
    fwhm / (8.0 * 2.0_f64.ln()).sqrt()
}

/// FWHM (mm) of the ALE kernel for a study with `sample_size` subjects.
///
/// Combines between-template and between-subject spatial uncertainty
/// (Eickhoff et al., 2009); the subject term shrinks with 1/sqrt(n).
pub fn ale_fwhm(sample_size: usize) -> f64 {
    let scale = (8.0 * 2.0_f64.ln()).sqrt() / (2.0 * (2.0 / std::f64::consts::PI).sqrt());
    let templates = 5.7 * scale;
    let subjects = 11.6 * scale / (sample_size as f64).sqrt();
    (templates.powi(2) + subjects.powi(2)).sqrt()
}

/// One-sided z-score of a p-value.
pub fn p_to_z(p: f64) -> f64 {
    let p = p.clamp(MIN_PVALUE, 1.0 - f64::EPSILON);
    Normal::standard().inverse_cdf(1.0 - p)
}

/// Upper-tail probability of a standard normal.
pub fn normal_sf(z: f64) -> f64 {
    Normal::standard().sf(z).max(MIN_PVALUE)
}

pub fn chi_squared_sf(x: f64, df: f64) -> f64 {
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(x.max(0.0)).max(MIN_PVALUE),
        Err(_) => f64::NAN,
    }
}

/// Value `x` with `P(X >= x) = p` under a chi-squared distribution.
pub fn chi_squared_isf(p: f64, df: f64) -> f64 {
    match ChiSquared::new(df) {
        Ok(dist) => dist.inverse_cdf(1.0 - p),
        Err(_) => f64::NAN,
    }
}


/// Empirical upper-tail p-value of `observed` against an ascending-sorted null.
///
/// Bounded below by `1 / null.len()`, the resolution of the null.
pub fn empirical_pvalue(observed: f64, sorted_null: &[f64]) -> f64 {
    let n = sorted_null.len();
    let below = sorted_null.partition_point(|v| *v < observed);
    let exceed = n - below;
    (exceed as f64 / n as f64).max(1.0 / n as f64)
}

fn xlogy(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        0.0
    } else {
        x * y.ln()
    }
}

/// Signed likelihood-ratio (G) statistic of a 2x2 table of active / inactive
/// counts in a target and a reference group.
///
/// Positive when the target activates more often than the reference.
pub fn two_sample_g(
    target_active: f64,
    n_target: f64,
    reference_active: f64,
    n_reference: f64,
) -> f64 {
    let total = n_target + n_reference;
    let active = target_active + reference_active;
    let inactive = total - active;
    if active == 0.0 || inactive == 0.0 {
        return 0.0;
    }
    let cells = [
        (target_active, n_target * active / total),
        (n_target - target_active, n_target * inactive / total),
        (reference_active, n_reference * active / total),
        (n_reference - reference_active, n_reference * inactive / total),
    ];
    let g = 2.0
        * cells
            .iter()
            .map(|(observed, expected)| xlogy(*observed, *observed / *expected))
            .sum::<f64>();
    let direction = target_active / n_target - reference_active / n_reference;
    g.max(0.0).copysign(direction)
}

/// Signed G statistic of `active` of `n` studies against an expected rate.
pub fn one_sample_g(active: f64, n: f64, rate: f64) -> f64 {
    if rate <= 0.0 || rate >= 1.0 {
        return 0.0;
    }
    let expected = n * rate;
    let g = 2.0
        * (xlogy(active, active / expected) + xlogy(n - active, (n - active) / (n - expected)));
    g.max(0.0).copysign(active - expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fwhm_to_sigma() {
        assert_relative_eq!(fwhm_to_sigma(2.354820045), 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_ale_fwhm_decreases_with_sample_size() {
        assert!(ale_fwhm(10) > ale_fwhm(20));
        // the template term is the floor
        let floor = 5.7 * (8.0 * 2.0_f64.ln()).sqrt() / (2.0 * (2.0 / std::f64::consts::PI).sqrt());
        assert!(ale_fwhm(1_000_000) > floor);
        assert_relative_eq!(ale_fwhm(1_000_000), floor, epsilon = 1e-2);
    }

    #[test]
    fn test_p_to_z() {
        assert_relative_eq!(p_to_z(0.5), 0.0, epsilon = 1e-9);
        assert_relative_eq!(p_to_z(0.05), 1.6448536269514722, epsilon = 1e-6);
        assert!(p_to_z(0.0).is_finite());
    }

    #[test]
    fn test_normal_sf_inverts_p_to_z() {
        assert_relative_eq!(normal_sf(0.0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(normal_sf(p_to_z(0.01)), 0.01, epsilon = 1e-9);
        assert_eq!(normal_sf(100.0), MIN_PVALUE);
    }

    #[test]
    fn test_empirical_pvalue_resolution() {
        let null = vec![1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(empirical_pvalue(2.5, &null), 0.5);
        assert_relative_eq!(empirical_pvalue(2.0, &null), 0.75);
        assert_relative_eq!(empirical_pvalue(10.0, &null), 0.25);
        assert_relative_eq!(empirical_pvalue(0.0, &null), 1.0);
    }

    #[test]
    fn test_two_sample_g_sign_and_symmetry() {
        let up = two_sample_g(8.0, 10.0, 2.0, 10.0);
        let down = two_sample_g(2.0, 10.0, 8.0, 10.0);
        assert!(up > 0.0);
        assert_relative_eq!(up, -down, epsilon = 1e-12);
        assert_eq!(two_sample_g(5.0, 10.0, 5.0, 10.0), 0.0);
        assert_eq!(two_sample_g(0.0, 10.0, 0.0, 10.0), 0.0);
    }

    #[test]
    fn test_chi_squared_round_trip() {
        let x = chi_squared_isf(0.001, 1.0);
        assert_relative_eq!(chi_squared_sf(x, 1.0), 0.001, epsilon = 1e-8);
        assert_relative_eq!(x, 10.827566170662733, epsilon = 1e-6);
    }

    #[test]
    fn test_one_sample_g() {
        assert!(one_sample_g(9.0, 10.0, 0.1) > 0.0);
        assert!(one_sample_g(0.0, 10.0, 0.5) < 0.0);
        assert_eq!(one_sample_g(3.0, 10.0, 0.0), 0.0);
    }
}
