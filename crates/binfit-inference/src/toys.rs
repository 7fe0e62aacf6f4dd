//! Pseudo-data generation for toy studies.
//!
//! Frequentist toys Poisson-sample around the expected yield at nominal
//! parameters (or around the observed counts when bootstrapping); Bayesian
//! toys first draw the constrained nuisance parameters from their unit
//! Gaussian priors. Every toy is seeded as `seed + toy_index` so batches are
//! reproducible regardless of execution order.

use binfit_core::{Error, Result};
use binfit_tensor::ModelTensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson, StandardNormal};

/// Seeded generator of pseudo-experiments over one model tensor.
pub struct ToyGenerator<'a> {
    tensor: &'a ModelTensor,
    seed: u64,
    expect_signal: f64,
    bayesian: bool,
    bootstrap_data: bool,
}

impl<'a> ToyGenerator<'a> {
    /// Create a generator with the base seed and the nominal signal strength.
    pub fn new(tensor: &'a ModelTensor, seed: u64, expect_signal: f64) -> Self {
        Self { tensor, seed, expect_signal, bayesian: false, bootstrap_data: false }
    }

    /// Sample constrained nuisance parameters from their priors per toy.
    pub fn with_bayesian(mut self, bayesian: bool) -> Self {
        self.bayesian = bayesian;
        self
    }

    /// Sample counts around the observed data instead of the expectation.
    pub fn with_bootstrap_data(mut self, bootstrap: bool) -> Self {
        self.bootstrap_data = bootstrap;
        self
    }

    /// Nominal parameter vector: POIs at the configured signal strength,
    /// nuisance parameters at zero.
    pub fn defaultassign(&self) -> Vec<f64> {
        let mut params = vec![0.0; self.tensor.nparams()];
        for p in params.iter_mut().take(self.tensor.npoi()) {
            *p = self.expect_signal;
        }
        params
    }

    /// Asimov pseudo-data: the noiseless expectation at nominal parameters.
    pub fn asimov<F>(&self, expected_at: F) -> (Vec<f64>, Vec<f64>)
    where
        F: Fn(&[f64]) -> Vec<f64>,
    {
        let params = self.defaultassign();
        let counts = expected_at(&params);
        (params, counts)
    }

    /// Generate one pseudo-experiment.
    ///
    /// Returns the parameter vector the toy was generated at together with
    /// the sampled counts. `observed` is required in bootstrap mode.
    pub fn toyassign<F>(
        &self,
        itoy: u64,
        expected_at: F,
        observed: Option<&[f64]>,
    ) -> Result<(Vec<f64>, Vec<f64>)>
    where
        F: Fn(&[f64]) -> Vec<f64>,
    {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(itoy));
        let mut params = self.defaultassign();

        if self.bayesian {
            let npoi = self.tensor.npoi();
            for isyst in 0..self.tensor.nsyst() {
                if self.tensor.is_constrained(isyst) {
                    params[npoi + isyst] = rng.sample(StandardNormal);
                }
            }
        }

        let rates = if self.bootstrap_data {
            observed
                .ok_or_else(|| {
                    Error::Configuration(
                        "Bootstrap toys require an observed data histogram".to_string(),
                    )
                })?
                .to_vec()
        } else {
            expected_at(&params)
        };

        let mut counts = Vec::with_capacity(rates.len());
        for &rate in &rates {
            if rate <= 0.0 {
                counts.push(0.0);
                continue;
            }
            let poisson = Poisson::new(rate).map_err(|e| {
                Error::DataIntegrity(format!("Invalid Poisson rate {rate}: {e}"))
            })?;
            counts.push(poisson.sample(&mut rng));
        }
        Ok((params, counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binfit_tensor::{LogkStorage, NormStorage};

    fn tiny_tensor() -> ModelTensor {
        ModelTensor {
            channels: vec![],
            nbins: 3,
            procs: vec!["sig".into()],
            nsignals: 1,
            systs: vec!["scale".into()],
            systsnoi: vec![],
            systsnoconstraint: vec![],
            systsnoprofile: vec![],
            constraintweights: vec![1.0],
            systgroups: vec![],
            noigroups: vec![],
            kstat: vec![1.0; 3],
            data_obs: Some(vec![45.0, 32.0, 11.0]),
            pseudodata_names: vec![],
            pseudodata: vec![],
            data_cov_inv: None,
            symmetric: true,
            norm: NormStorage::Dense(vec![40.0, 30.0, 10.0]),
            logk: LogkStorage::Dense(vec![0.1, 0.1, 0.1]),
        }
    }

    fn expectation(params: &[f64]) -> Vec<f64> {
        // mu * nominal * exp(0.1 * theta)
        let factor = (0.1 * params[1]).exp();
        vec![40.0, 30.0, 10.0].into_iter().map(|v| params[0] * v * factor).collect()
    }

    #[test]
    fn test_defaultassign() {
        let t = tiny_tensor();
        let gen = ToyGenerator::new(&t, 17, 1.0);
        assert_eq!(gen.defaultassign(), vec![1.0, 0.0]);
        let gen2 = ToyGenerator::new(&t, 17, 0.5);
        assert_eq!(gen2.defaultassign(), vec![0.5, 0.0]);
    }

    #[test]
    fn test_asimov_is_noiseless_expectation() {
        let t = tiny_tensor();
        let gen = ToyGenerator::new(&t, 17, 1.0);
        let (params, counts) = gen.asimov(expectation);
        assert_eq!(params, vec![1.0, 0.0]);
        assert_eq!(counts, vec![40.0, 30.0, 10.0]);
    }

    #[test]
    fn test_toy_reproducibility() {
        let t = tiny_tensor();
        for bayesian in [false, true] {
            let gen_a = ToyGenerator::new(&t, 42, 1.0).with_bayesian(bayesian);
            let gen_b = ToyGenerator::new(&t, 42, 1.0).with_bayesian(bayesian);
            let (pa, ca) = gen_a.toyassign(3, expectation, None).unwrap();
            let (pb, cb) = gen_b.toyassign(3, expectation, None).unwrap();
            assert_eq!(pa, pb);
            assert_eq!(ca, cb);

            let (_, other) = gen_a.toyassign(4, expectation, None).unwrap();
            assert_ne!(ca, other);
        }
    }

    #[test]
    fn test_bayesian_perturbs_constrained_nuisances() {
        let t = tiny_tensor();
        let gen = ToyGenerator::new(&t, 7, 1.0).with_bayesian(true);
        let (params, _) = gen.toyassign(0, expectation, None).unwrap();
        assert_eq!(params[0], 1.0);
        assert_ne!(params[1], 0.0);

        let frequentist = ToyGenerator::new(&t, 7, 1.0);
        let (params, _) = frequentist.toyassign(0, expectation, None).unwrap();
        assert_eq!(params[1], 0.0);
    }

    #[test]
    fn test_bootstrap_requires_and_uses_observed() {
        let t = tiny_tensor();
        let gen = ToyGenerator::new(&t, 5, 1.0).with_bootstrap_data(true);
        assert!(matches!(
            gen.toyassign(0, expectation, None),
            Err(Error::Configuration(_))
        ));

        // sampled around the observed counts, not the expectation: with a
        // rate of zero the sample is exactly zero
        let observed = vec![45.0, 0.0, 11.0];
        let (_, counts) = gen.toyassign(0, expectation, Some(&observed)).unwrap();
        assert_eq!(counts[1], 0.0);
        assert_eq!(counts.len(), 3);
    }

    #[test]
    fn test_poisson_counts_are_nonnegative_integers() {
        let t = tiny_tensor();
        let gen = ToyGenerator::new(&t, 11, 1.0);
        let (_, counts) = gen.toyassign(0, expectation, None).unwrap();
        for &c in &counts {
            assert!(c >= 0.0);
            assert_eq!(c, c.trunc());
        }
    }
}
