//! Common data types for binfit

use serde::{Deserialize, Serialize};

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Parameter names, in fit order (POIs first, then nuisance parameters).
    pub parameter_names: Vec<String>,

    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Negative log-likelihood at minimum
    pub nll: f64,

    /// Saturated-model negative log-likelihood (goodness-of-fit baseline).
    pub nll_saturated: f64,

    /// Effective degrees of freedom for the saturated comparison.
    pub ndf: usize,

    /// Convergence status
    pub converged: bool,

    /// Number of optimizer iterations
    pub n_iter: usize,

    /// Number of function evaluations
    pub n_evaluations: usize,
}

impl FitResult {
    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }

    /// Look up a parameter value by name.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        let idx = self.parameter_names.iter().position(|n| n == name)?;
        self.parameters.get(idx).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_result() -> FitResult {
        FitResult {
            parameter_names: vec!["mu".into(), "np0".into()],
            parameters: vec![1.0, 0.2],
            uncertainties: vec![0.1, 0.9],
            covariance: Some(vec![0.01, 0.0045, 0.0045, 0.81]),
            nll: 12.5,
            nll_saturated: 11.9,
            ndf: 3,
            converged: true,
            n_iter: 7,
            n_evaluations: 23,
        }
    }

    #[test]
    fn test_correlation() {
        let r = dummy_result();
        let c = r.correlation(0, 1).unwrap();
        assert!((c - 0.05).abs() < 1e-12);
        assert_eq!(r.correlation(0, 2), None);
    }

    #[test]
    fn test_parameter_lookup() {
        let r = dummy_result();
        assert_eq!(r.parameter("np0"), Some(0.2));
        assert_eq!(r.parameter("missing"), None);
    }
}
