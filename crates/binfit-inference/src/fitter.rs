//! Fit session: data / Asimov / toy campaigns over one model tensor.
//!
//! The schedule follows the toy count: `-1` fits the Asimov dataset, `0` fits
//! the observed (or selected pseudo-) data, `N > 0` runs `N` seeded toys.
//! Toys run in parallel; a failed toy is recorded and the batch continues.

use binfit_core::{Error, FitResult, Result};
use binfit_tensor::ModelTensor;
use rayon::prelude::*;

use crate::covariance::postfit_covariance;
use crate::likelihood::{LikelihoodOptions, LikelihoodSurface};
use crate::optimizer::NewtonOptimizer;
use crate::toys::ToyGenerator;

/// Configuration of a fit campaign.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// `-1` = Asimov fit, `0` = data fit, `N > 0` = N toys.
    pub ntoys: i64,
    /// Base seed; toy `i` uses `seed + i`.
    pub seed: u64,
    /// Nominal signal strength for default assignment and toy generation.
    pub expect_signal: f64,
    /// Allow the signal strengths to go negative.
    pub allow_negative_poi: bool,
    /// Sample constrained nuisances from their priors when generating toys.
    pub toys_bayesian: bool,
    /// Sample toy counts around the observed data instead of the expectation.
    pub bootstrap_data: bool,
    /// Profile Barlow-Beeston-lite per-bin statistical nuisances.
    pub binbybinstat: bool,
    /// Chi-square fit instead of the Poisson likelihood.
    pub chisq: bool,
    /// Use the tensor's full external inverted data covariance in the
    /// chi-square fit.
    pub external_covariance: bool,
    /// Fit a named pseudo-data set instead of the observed data.
    pub pseudodata: Option<String>,
    /// Prior width assigned to unconstrained parameters in the prefit
    /// covariance.
    pub unconstrained_err: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            ntoys: -1,
            seed: 123456789,
            expect_signal: 1.0,
            allow_negative_poi: false,
            toys_bayesian: false,
            bootstrap_data: false,
            binbybinstat: false,
            chisq: false,
            external_covariance: false,
            pseudodata: None,
            unconstrained_err: 1.0,
        }
    }
}

/// One labelled outcome of a campaign (`results`, `results_asimov`,
/// `results_toyN`).
pub struct FitOutcome {
    /// Result-group label.
    pub label: String,
    /// The fit result, or the recorded per-fit failure.
    pub result: Result<FitResult>,
}

/// Fit session bound to an immutable model tensor.
pub struct Fitter<'a> {
    tensor: &'a ModelTensor,
    config: FitConfig,
    optimizer: NewtonOptimizer,
}

impl<'a> Fitter<'a> {
    /// Create a session; configuration inconsistencies fail here rather than
    /// mid-campaign.
    pub fn new(tensor: &'a ModelTensor, config: FitConfig) -> Result<Self> {
        if config.external_covariance && !config.chisq {
            return Err(Error::Configuration(
                "The external data covariance applies to the chi-square fit only".to_string(),
            ));
        }
        if config.external_covariance && tensor.data_cov_inv.is_none() {
            return Err(Error::Configuration(
                "External covariance requested but the tensor carries none".to_string(),
            ));
        }
        if config.chisq && config.binbybinstat {
            return Err(Error::Configuration(
                "Bin-by-bin statistical nuisances are defined for the Poisson likelihood only"
                    .to_string(),
            ));
        }
        if let Some(name) = &config.pseudodata {
            if !tensor.pseudodata_names.iter().any(|n| n == name) {
                return Err(Error::Configuration(format!(
                    "Pseudodata set '{name}' is not present in the tensor"
                )));
            }
        }
        Ok(Self { tensor, config, optimizer: NewtonOptimizer::default() })
    }

    /// Replace the default minimizer.
    pub fn with_optimizer(mut self, optimizer: NewtonOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// The model tensor this session fits.
    pub fn tensor(&self) -> &ModelTensor {
        self.tensor
    }

    /// The campaign configuration.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// The minimizer used by this session.
    pub fn optimizer(&self) -> &NewtonOptimizer {
        &self.optimizer
    }

    /// Box bounds for the fit parameter vector.
    ///
    /// Signal strengths are non-negative unless configured otherwise;
    /// never-profiled systematics are pinned at zero by degenerate bounds.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        let t = self.tensor;
        let mut bounds = Vec::with_capacity(t.nparams());
        for _ in 0..t.npoi() {
            if self.config.allow_negative_poi {
                bounds.push((f64::NEG_INFINITY, f64::INFINITY));
            } else {
                bounds.push((0.0, f64::INFINITY));
            }
        }
        for isyst in 0..t.nsyst() {
            if t.is_profiled(isyst) {
                bounds.push((f64::NEG_INFINITY, f64::INFINITY));
            } else {
                bounds.push((0.0, 0.0));
            }
        }
        bounds
    }

    /// Statistical-model options derived from the configuration.
    pub fn likelihood_options(&self) -> LikelihoodOptions {
        LikelihoodOptions {
            chisq: self.config.chisq,
            external_covariance: self.config.external_covariance,
            binbybinstat: self.config.binbybinstat,
        }
    }

    /// Bind an observation into a likelihood surface with this session's
    /// options.
    pub fn surface(&self, data: Vec<f64>) -> Result<LikelihoodSurface<'a>> {
        LikelihoodSurface::new(self.tensor, data, self.likelihood_options())
    }

    fn toy_generator(&self) -> ToyGenerator<'a> {
        ToyGenerator::new(self.tensor, self.config.seed, self.config.expect_signal)
            .with_bayesian(self.config.toys_bayesian)
            .with_bootstrap_data(self.config.bootstrap_data)
    }

    /// Expected yield at the given parameters, independent of any observation.
    pub fn expected_yield(&self, params: &[f64]) -> Result<Vec<f64>> {
        let probe = LikelihoodSurface::new(
            self.tensor,
            vec![0.0; self.tensor.nbins],
            LikelihoodOptions::default(),
        )?;
        Ok(probe.expected_yield(params))
    }

    /// Run one fit against the given observation.
    pub fn fit(&self, data: Vec<f64>) -> Result<FitResult> {
        let surface = self.surface(data)?;
        let bounds = self.bounds();
        let init = self.toy_generator().defaultassign();

        let res = self.optimizer.minimize(&surface, &init, &bounds)?;
        if !res.converged {
            return Err(Error::ConvergenceFailure(res.message));
        }
        log::debug!("Fit converged: {res}");

        let covariance = match postfit_covariance(&surface, &res.parameters, &bounds) {
            Ok(cov) => Some(cov),
            Err(Error::SingularHessian(msg)) => {
                log::warn!("Covariance unavailable: {msg}");
                None
            }
            Err(e) => return Err(e),
        };
        let n = res.parameters.len();
        let uncertainties = match &covariance {
            Some(cov) => (0..n).map(|i| cov[i * n + i].max(0.0).sqrt()).collect(),
            None => vec![0.0; n],
        };
        let (nll_saturated, ndf) = surface.saturated_nll();

        Ok(FitResult {
            parameter_names: self.tensor.parameter_names(),
            parameters: res.parameters,
            uncertainties,
            covariance,
            nll: res.fval,
            nll_saturated,
            ndf,
            converged: true,
            n_iter: res.n_iter as usize,
            n_evaluations: res.n_fev,
        })
    }

    /// Fit the observed data (or the configured pseudo-data set).
    pub fn fit_data(&self) -> Result<FitResult> {
        let data = self
            .tensor
            .observation(self.config.pseudodata.as_deref())
            .ok_or_else(|| {
                Error::Configuration("The tensor carries no observed data".to_string())
            })?;
        self.fit(data)
    }

    /// Fit the Asimov dataset (expectation at nominal parameters).
    pub fn fit_asimov(&self) -> Result<FitResult> {
        let generator = self.toy_generator();
        let nominal = generator.defaultassign();
        let asimov = self.expected_yield(&nominal)?;
        self.fit(asimov)
    }

    /// Run `n` toys in parallel; failures are isolated per toy.
    pub fn fit_toys(&self, n: u64) -> Vec<Result<FitResult>> {
        let observed = self.tensor.data_obs.clone();
        (0..n)
            .into_par_iter()
            .map(|itoy| {
                let probe = LikelihoodSurface::new(
                    self.tensor,
                    vec![0.0; self.tensor.nbins],
                    LikelihoodOptions::default(),
                )?;
                let generator = self.toy_generator();
                let (_, counts) = generator.toyassign(
                    itoy,
                    |params| probe.expected_yield(params),
                    observed.as_deref(),
                )?;
                self.fit(counts)
            })
            .collect()
    }

    /// Run the configured campaign and label the outcomes.
    pub fn run(&self) -> Vec<FitOutcome> {
        match self.config.ntoys {
            -1 => vec![FitOutcome { label: "results_asimov".to_string(), result: self.fit_asimov() }],
            0 => vec![FitOutcome { label: "results".to_string(), result: self.fit_data() }],
            n if n > 0 => self
                .fit_toys(n as u64)
                .into_iter()
                .enumerate()
                .map(|(i, result)| {
                    if let Err(e) = &result {
                        log::warn!("Toy {i} failed: {e}");
                    }
                    FitOutcome { label: format!("results_toy{i}"), result }
                })
                .collect(),
            n => vec![FitOutcome {
                label: "results".to_string(),
                result: Err(Error::Configuration(format!("Invalid toy count {n}"))),
            }],
        }
    }
}
