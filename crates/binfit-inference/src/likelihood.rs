//! Negative log-likelihood surface over the model tensor.
//!
//! The expected yield per bin is a product of the nominal process yields with
//! multiplicative log-normal systematic responses. For asymmetric tensors the
//! response interpolates smoothly between the up and down half-differences
//! across theta = 0 using a quintic sign approximation (C2-continuous, exact
//! sign outside |theta| <= 1).
//!
//! The statistical term is Poisson by default, optionally with profiled
//! Barlow-Beeston-lite per-bin nuisances (closed form, so they never enter
//! the parameter vector), or a chi-square form, either diagonal in the
//! observed-count variances or against an external inverted data covariance.
//! Constrained systematics add `w * theta^2 / 2`.

use binfit_core::{Error, Result};
use binfit_tensor::ModelTensor;
use statrs::function::gamma::ln_gamma;

use crate::optimizer::ObjectiveFunction;

/// Floor on the expected yield before taking logarithms.
const YIELD_FLOOR: f64 = 1e-10;

/// Statistical-model options for a likelihood surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct LikelihoodOptions {
    /// Chi-square statistical term instead of the Poisson term. Without
    /// [`external_covariance`](Self::external_covariance) the covariance is
    /// diagonal with the observed counts as variances.
    pub chisq: bool,
    /// Use the tensor's full external inverted data covariance in the
    /// chi-square term.
    pub external_covariance: bool,
    /// Profile Barlow-Beeston-lite per-bin statistical nuisances.
    pub binbybinstat: bool,
}

/// The NLL as a function of the fit parameter vector (POIs then systematics).
pub struct LikelihoodSurface<'a> {
    tensor: &'a ModelTensor,
    data: Vec<f64>,
    options: LikelihoodOptions,
    /// Inverse variances for the diagonal chi-square mode.
    chisq_diag: Option<Vec<f64>>,
}

/// Quintic smooth approximation of `sign(theta)` on `[-1, 1]`.
///
/// Matches value, first and second derivative of `sign` at `theta = +-1`.
fn smooth_sign(theta: f64) -> f64 {
    if theta.abs() >= 1.0 {
        theta.signum()
    } else {
        let t2 = theta * theta;
        0.125 * theta * (15.0 - 10.0 * t2 + 3.0 * t2 * t2)
    }
}

fn smooth_sign_deriv(theta: f64) -> f64 {
    if theta.abs() >= 1.0 {
        0.0
    } else {
        let u = 1.0 - theta * theta;
        1.875 * u * u
    }
}

/// Exponent of the systematic response: `theta * (avg + f(theta) * halfdiff)`.
fn response_exponent(theta: f64, avg: f64, halfdiff: f64) -> f64 {
    theta * (avg + smooth_sign(theta) * halfdiff)
}

/// Derivative of [`response_exponent`] with respect to `theta`.
fn response_exponent_deriv(theta: f64, avg: f64, halfdiff: f64) -> f64 {
    avg + (smooth_sign(theta) + theta * smooth_sign_deriv(theta)) * halfdiff
}

impl<'a> LikelihoodSurface<'a> {
    /// Bind a tensor and an observation vector into an NLL surface.
    pub fn new(
        tensor: &'a ModelTensor,
        data: Vec<f64>,
        options: LikelihoodOptions,
    ) -> Result<Self> {
        if data.len() != tensor.nbins {
            return Err(Error::Configuration(format!(
                "Observation has {} bins but the tensor has {}",
                data.len(),
                tensor.nbins
            )));
        }
        if options.external_covariance && !options.chisq {
            return Err(Error::Configuration(
                "The external data covariance applies to the chi-square fit only".to_string(),
            ));
        }
        if options.external_covariance && tensor.data_cov_inv.is_none() {
            return Err(Error::Configuration(
                "External covariance requested but the tensor carries none".to_string(),
            ));
        }
        if options.chisq && options.binbybinstat {
            return Err(Error::Configuration(
                "Bin-by-bin statistical nuisances are defined for the Poisson likelihood only"
                    .to_string(),
            ));
        }
        let chisq_diag = (options.chisq && !options.external_covariance)
            .then(|| data.iter().map(|&n| 1.0 / n.max(1.0)).collect());
        Ok(Self { tensor, data, options, chisq_diag })
    }

    /// The model tensor this surface is bound to.
    pub fn tensor(&self) -> &ModelTensor {
        self.tensor
    }

    /// The observation vector this surface is bound to.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    fn mu_eff(&self, params: &[f64], proc: usize) -> f64 {
        if proc < self.tensor.nsignals { params[proc] } else { 1.0 }
    }

    /// Per-(bin, process) yield without the signal strength: nominal times
    /// the product of systematic responses. Row-major `nbins x nproc`.
    fn base_terms(&self, params: &[f64]) -> Vec<f64> {
        let t = self.tensor;
        let (nbins, nproc, nsyst, npoi) = (t.nbins, t.nproc(), t.nsyst(), t.npoi());
        let mut terms = vec![0.0; nbins * nproc];
        for bin in 0..nbins {
            for proc in 0..nproc {
                let nom = t.norm_at(bin, proc);
                if nom == 0.0 {
                    continue;
                }
                let mut exponent = 0.0;
                for isyst in 0..nsyst {
                    let theta = params[npoi + isyst];
                    if theta == 0.0 {
                        continue;
                    }
                    let avg = t.logk_at(bin, proc, 0, isyst);
                    let halfdiff = t.logk_at(bin, proc, 1, isyst);
                    exponent += response_exponent(theta, avg, halfdiff);
                }
                terms[bin * nproc + proc] = nom * exponent.exp();
            }
        }
        terms
    }

    /// Expected yield per bin at the given parameters.
    pub fn expected_yield(&self, params: &[f64]) -> Vec<f64> {
        let t = self.tensor;
        let nproc = t.nproc();
        let terms = self.base_terms(params);
        (0..t.nbins)
            .map(|bin| {
                (0..nproc).map(|proc| self.mu_eff(params, proc) * terms[bin * nproc + proc]).sum()
            })
            .collect()
    }

    /// Profiled Barlow-Beeston-lite scale for one bin.
    fn beta(&self, n: f64, nu: f64, k: f64) -> f64 {
        (n + k) / (nu + k)
    }

    /// `C^{-1} (n - nu)` for the active chi-square covariance.
    fn chisq_contraction(&self, expected: &[f64]) -> Result<Vec<f64>> {
        let nbins = self.tensor.nbins;
        let resid: Vec<f64> =
            self.data.iter().zip(expected).map(|(&n, &nu)| n - nu).collect();
        if let Some(diag) = &self.chisq_diag {
            return Ok(resid.iter().zip(diag).map(|(&r, &w)| r * w).collect());
        }
        let cov_inv = self.tensor.data_cov_inv.as_deref().ok_or_else(|| {
            Error::Configuration("Chi-square fit without data covariance".to_string())
        })?;
        Ok((0..nbins)
            .map(|i| (0..nbins).map(|j| cov_inv[i * nbins + j] * resid[j]).sum())
            .collect())
    }

    /// Statistical + constraint NLL, including observation-dependent constants
    /// so that differences against [`saturated_nll`](Self::saturated_nll) form
    /// a likelihood-ratio statistic.
    pub fn full_nll(&self, params: &[f64]) -> Result<f64> {
        let t = self.tensor;
        let nproc = t.nproc();
        let terms = self.base_terms(params);
        let expected: Vec<f64> = (0..t.nbins)
            .map(|bin| {
                (0..nproc)
                    .map(|proc| self.mu_eff(params, proc) * terms[bin * nproc + proc])
                    .sum::<f64>()
            })
            .collect();

        let mut nll = 0.0;
        if self.options.chisq {
            let contracted = self.chisq_contraction(&expected)?;
            for (bin, &c) in contracted.iter().enumerate() {
                nll += 0.5 * (self.data[bin] - expected[bin]) * c;
            }
        } else {
            for bin in 0..t.nbins {
                let n = self.data[bin];
                let nu = expected[bin].max(YIELD_FLOOR);
                if self.options.binbybinstat {
                    let k = t.kstat[bin];
                    let beta = self.beta(n, nu, k);
                    let scaled = beta * nu;
                    nll += scaled - n * scaled.ln() + ln_gamma(n + 1.0);
                    let aux = beta * k;
                    nll += aux - k * aux.ln() + ln_gamma(k + 1.0);
                } else {
                    nll += nu - n * nu.ln() + ln_gamma(n + 1.0);
                }
            }
        }

        let npoi = t.npoi();
        for isyst in 0..t.nsyst() {
            let theta = params[npoi + isyst];
            nll += 0.5 * t.constraintweights[isyst] * theta * theta;
        }

        if !nll.is_finite() {
            return Err(Error::DataIntegrity(
                "NLL evaluated to a non-finite value".to_string(),
            ));
        }
        Ok(nll)
    }

    /// NLL of the saturated model (expectation equal to observation) and the
    /// effective degrees of freedom for goodness-of-fit.
    pub fn saturated_nll(&self) -> (f64, usize) {
        let t = self.tensor;
        let mut nll = 0.0;
        if !self.options.chisq {
            for bin in 0..t.nbins {
                let n = self.data[bin];
                if n > 0.0 {
                    nll += n - n * n.ln();
                }
                nll += ln_gamma(n + 1.0);
                if self.options.binbybinstat {
                    let k = t.kstat[bin];
                    nll += k - k * k.ln() + ln_gamma(k + 1.0);
                }
            }
        }
        let nfree = t.npoi() + t.nsyst_profiled();
        let ndf = t.nbins.saturating_sub(nfree);
        (nll, ndf)
    }

    /// Analytic gradient of [`full_nll`](Self::full_nll).
    pub fn nll_gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let t = self.tensor;
        let (nbins, nproc, nsyst, npoi) = (t.nbins, t.nproc(), t.nsyst(), t.npoi());
        let terms = self.base_terms(params);
        let expected: Vec<f64> = (0..nbins)
            .map(|bin| {
                (0..nproc)
                    .map(|proc| self.mu_eff(params, proc) * terms[bin * nproc + proc])
                    .sum::<f64>()
            })
            .collect();

        // dNLL / d(expected yield) per bin; for the profiled Barlow-Beeston
        // scale the envelope theorem makes the beta-dependence drop out
        let weights: Vec<f64> = if self.options.chisq {
            self.chisq_contraction(&expected)?.into_iter().map(|c| -c).collect()
        } else {
            (0..nbins)
                .map(|bin| {
                    let n = self.data[bin];
                    let nu = expected[bin].max(YIELD_FLOOR);
                    if self.options.binbybinstat {
                        self.beta(n, nu, t.kstat[bin]) - n / nu
                    } else {
                        1.0 - n / nu
                    }
                })
                .collect()
        };

        let mut grad = vec![0.0; t.nparams()];
        for bin in 0..nbins {
            let w = weights[bin];
            if w == 0.0 {
                continue;
            }
            for proc in 0..nproc {
                let term = terms[bin * nproc + proc];
                if term == 0.0 {
                    continue;
                }
                if proc < t.nsignals {
                    grad[proc] += w * term;
                }
                let scaled = self.mu_eff(params, proc) * term;
                if scaled == 0.0 {
                    continue;
                }
                for isyst in 0..nsyst {
                    let avg = t.logk_at(bin, proc, 0, isyst);
                    let halfdiff = t.logk_at(bin, proc, 1, isyst);
                    if avg == 0.0 && halfdiff == 0.0 {
                        continue;
                    }
                    let theta = params[npoi + isyst];
                    grad[npoi + isyst] +=
                        w * scaled * response_exponent_deriv(theta, avg, halfdiff);
                }
            }
        }

        for isyst in 0..nsyst {
            grad[npoi + isyst] += t.constraintweights[isyst] * params[npoi + isyst];
        }
        Ok(grad)
    }
}

impl ObjectiveFunction for LikelihoodSurface<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.full_nll(params)
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        self.nll_gradient(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use binfit_tensor::{
        ArrayHistogram, Axis, ModelTensor, ModelTensorBuilder, Symmetrization, SystematicOptions,
        Variation,
    };

    fn axes() -> Vec<Axis> {
        vec![Axis::regular("x", 2, 0.0, 2.0)]
    }

    fn hist(values: Vec<f64>) -> ArrayHistogram {
        ArrayHistogram::new(axes(), values).unwrap()
    }

    fn demo_tensor(asymmetric: bool) -> ModelTensor {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(
            &hist(vec![10.0, 5.0]).with_variances(vec![2.0, 1.0]).unwrap(),
            "sig",
            "ch0",
            true,
        )
        .unwrap();
        b.add_process(&hist(vec![2.0, 3.0]), "bkg", "ch0", false).unwrap();
        b.add_data(&hist(vec![12.0, 8.0]), "ch0").unwrap();

        let up = hist(vec![11.0, 5.5]);
        let down = hist(vec![9.2, 4.6]);
        let opts = SystematicOptions {
            symmetrize: if asymmetric { Symmetrization::None } else { Symmetrization::Average },
            ..Default::default()
        };
        b.add_systematic(Variation::UpDown(&up, &down), "shape_sig", "sig", "ch0", &opts).unwrap();
        b.add_lnn_systematic("norm_bkg", "bkg", "ch0", 1.05, &SystematicOptions::default())
            .unwrap();
        b.finalize().unwrap()
    }

    fn fd_gradient(surface: &LikelihoodSurface<'_>, params: &[f64]) -> Vec<f64> {
        let n = params.len();
        let mut grad = vec![0.0; n];
        for i in 0..n {
            let eps = 1e-6 * params[i].abs().max(1.0);
            let mut plus = params.to_vec();
            plus[i] += eps;
            let mut minus = params.to_vec();
            minus[i] -= eps;
            grad[i] = (surface.full_nll(&plus).unwrap() - surface.full_nll(&minus).unwrap())
                / (2.0 * eps);
        }
        grad
    }

    fn assert_gradient_matches(surface: &LikelihoodSurface<'_>, params: &[f64]) {
        let analytic = surface.nll_gradient(params).unwrap();
        let numeric = fd_gradient(surface, params);
        for (i, (&a, &n)) in analytic.iter().zip(&numeric).enumerate() {
            let tol = 1e-6 * a.abs().max(1.0);
            assert!((a - n).abs() < tol, "component {i}: analytic {a} vs numeric {n}");
        }
    }

    #[test]
    fn test_expected_yield_at_nominal() {
        let t = demo_tensor(false);
        let surface =
            LikelihoodSurface::new(&t, t.data_obs.clone().unwrap(), LikelihoodOptions::default())
                .unwrap();
        let params = vec![1.0, 0.0, 0.0];
        let expected = surface.expected_yield(&params);
        assert_relative_eq!(expected[0], 12.0, epsilon = 1e-12);
        assert_relative_eq!(expected[1], 8.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        for asymmetric in [false, true] {
            let t = demo_tensor(asymmetric);
            let surface = LikelihoodSurface::new(
                &t,
                t.data_obs.clone().unwrap(),
                LikelihoodOptions::default(),
            )
            .unwrap();
            assert_gradient_matches(&surface, &[1.0, 0.0, 0.0]);
            assert_gradient_matches(&surface, &[1.3, 0.4, -0.8]);
            // probe the interpolation region boundary
            assert_gradient_matches(&surface, &[0.7, -1.2, 0.95]);
        }
    }

    #[test]
    fn test_gradient_matches_with_binbybinstat() {
        let t = demo_tensor(true);
        let surface = LikelihoodSurface::new(
            &t,
            t.data_obs.clone().unwrap(),
            LikelihoodOptions { binbybinstat: true, ..Default::default() },
        )
        .unwrap();
        assert_gradient_matches(&surface, &[1.0, 0.0, 0.0]);
        assert_gradient_matches(&surface, &[0.8, 0.5, -0.3]);
    }

    #[test]
    fn test_gradient_matches_chisq() {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(&hist(vec![10.0, 5.0]), "sig", "ch0", true).unwrap();
        b.add_data(&hist(vec![12.0, 8.0]), "ch0").unwrap();
        b.add_lnn_systematic("norm_sig", "sig", "ch0", 1.1, &SystematicOptions::default())
            .unwrap();
        b.add_data_covariance(&[4.0, 0.5, 0.5, 2.0]).unwrap();
        let t = b.finalize().unwrap();

        let surface = LikelihoodSurface::new(
            &t,
            t.data_obs.clone().unwrap(),
            LikelihoodOptions { chisq: true, external_covariance: true, ..Default::default() },
        )
        .unwrap();
        assert_gradient_matches(&surface, &[1.0, 0.0]);
        assert_gradient_matches(&surface, &[1.4, -0.6]);

        // without the external covariance the chi-square is diagonal with
        // the observed counts as variances
        let diag = LikelihoodSurface::new(
            &t,
            t.data_obs.clone().unwrap(),
            LikelihoodOptions { chisq: true, ..Default::default() },
        )
        .unwrap();
        assert_gradient_matches(&diag, &[1.0, 0.0]);
        assert_gradient_matches(&diag, &[1.4, -0.6]);
        // residuals (3, 3.5), variances (12, 8), theta = 0 so no constraint
        let nll = diag.full_nll(&[0.9, 0.0]).unwrap();
        assert_relative_eq!(nll, 0.5 * (9.0 / 12.0 + 12.25 / 8.0), epsilon = 1e-12);
    }

    #[test]
    fn test_asimov_data_is_stationary_and_saturated() {
        let t = demo_tensor(true);
        let probe =
            LikelihoodSurface::new(&t, vec![0.0; t.nbins], LikelihoodOptions::default()).unwrap();
        let nominal = vec![1.0, 0.0, 0.0];
        let asimov = probe.expected_yield(&nominal);

        let surface =
            LikelihoodSurface::new(&t, asimov, LikelihoodOptions::default()).unwrap();
        let grad = surface.nll_gradient(&nominal).unwrap();
        for g in &grad {
            assert!(g.abs() < 1e-9, "gradient component {g} not stationary");
        }
        let (saturated, ndf) = surface.saturated_nll();
        assert_relative_eq!(surface.full_nll(&nominal).unwrap(), saturated, epsilon = 1e-9);
        // 2 bins, 1 POI + 2 profiled systematics
        assert_eq!(ndf, 0);
    }

    #[test]
    fn test_smooth_interpolation_has_no_kink() {
        let t = demo_tensor(true);
        let surface =
            LikelihoodSurface::new(&t, t.data_obs.clone().unwrap(), LikelihoodOptions::default())
                .unwrap();
        // derivative is continuous across theta = 0 and theta = +-1
        for pivot in [0.0, 1.0, -1.0] {
            let lo = surface.nll_gradient(&[1.0, pivot - 1e-7, 0.0]).unwrap();
            let hi = surface.nll_gradient(&[1.0, pivot + 1e-7, 0.0]).unwrap();
            assert!((lo[1] - hi[1]).abs() < 1e-5, "kink at theta = {pivot}");
        }
    }

    #[test]
    fn test_perturbed_parameters_raise_nll_on_asimov() {
        let t = demo_tensor(false);
        let probe =
            LikelihoodSurface::new(&t, vec![0.0; t.nbins], LikelihoodOptions::default()).unwrap();
        let nominal = vec![1.0, 0.0, 0.0];
        let asimov = probe.expected_yield(&nominal);
        let surface = LikelihoodSurface::new(&t, asimov, LikelihoodOptions::default()).unwrap();

        let at_truth = surface.full_nll(&nominal).unwrap();
        for perturbed in [[1.2, 0.0, 0.0], [1.0, 0.7, 0.0], [0.9, -0.4, 0.6]] {
            assert!(surface.full_nll(&perturbed).unwrap() > at_truth);
        }
    }

    #[test]
    fn test_invalid_configurations_rejected() {
        let t = demo_tensor(false);
        assert!(matches!(
            LikelihoodSurface::new(&t, vec![1.0], LikelihoodOptions::default()),
            Err(Error::Configuration(_))
        ));
        // no covariance in the tensor
        assert!(matches!(
            LikelihoodSurface::new(
                &t,
                t.data_obs.clone().unwrap(),
                LikelihoodOptions { chisq: true, external_covariance: true, ..Default::default() }
            ),
            Err(Error::Configuration(_))
        ));
        // external covariance is meaningless outside the chi-square mode
        assert!(matches!(
            LikelihoodSurface::new(
                &t,
                t.data_obs.clone().unwrap(),
                LikelihoodOptions { external_covariance: true, ..Default::default() }
            ),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_chisq_with_binbybinstat_rejected() {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(&hist(vec![10.0, 5.0]), "sig", "ch0", true).unwrap();
        b.add_data(&hist(vec![12.0, 8.0]), "ch0").unwrap();
        b.add_data_covariance_inverted(vec![0.25, 0.0, 0.0, 0.5]).unwrap();
        let t = b.finalize().unwrap();
        assert!(matches!(
            LikelihoodSurface::new(
                &t,
                t.data_obs.clone().unwrap(),
                LikelihoodOptions { chisq: true, binbybinstat: true, ..Default::default() }
            ),
            Err(Error::Configuration(_))
        ));
    }
}
