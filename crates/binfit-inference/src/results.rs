//! Persisting fit outputs.
//!
//! Results go into the same chunked container format as the model tensor,
//! with every entry key prefixed by its run-group label (`results`,
//! `results_asimov`, `results_toyN`). Failed fits are recorded as an error
//! entry under the same label instead of aborting the file.

use std::path::Path;

use binfit_core::{FitResult, Result};
use binfit_tensor::ContainerWriter;
use serde::Serialize;

use crate::fitter::FitOutcome;
use crate::impacts::ImpactResult;
use crate::scan::{ContourResult, Scan2dResult, ScanResult};

/// Writer for fit campaign outputs.
pub struct ResultWriter {
    inner: ContainerWriter,
}

impl ResultWriter {
    /// Create (truncating) a results container.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self { inner: ContainerWriter::create(path)? })
    }

    /// Write a free-form metadata snapshot under `meta`.
    pub fn write_meta<T: Serialize>(&mut self, meta: &T) -> Result<()> {
        self.inner.put_json("meta", meta)
    }

    /// Write the fit parameter names (shared across all groups).
    pub fn write_parameter_names(&mut self, names: &[String]) -> Result<()> {
        self.inner.put_strings("parmnames", names)
    }

    /// Write one fit result under the given group label.
    pub fn write_fit(&mut self, group: &str, fit: &FitResult) -> Result<()> {
        let n = fit.parameters.len();
        self.inner.put_f64(&format!("{group}/parms"), &[n], &fit.parameters)?;
        self.inner.put_f64(&format!("{group}/err"), &[n], &fit.uncertainties)?;
        if let Some(cov) = &fit.covariance {
            self.inner.put_f64(&format!("{group}/cov"), &[n, n], cov)?;
        }
        self.inner.put_f64(&format!("{group}/nll"), &[2], &[fit.nll, fit.nll_saturated])?;
        self.inner.put_i64(&format!("{group}/ndf"), &[1], &[fit.ndf as i64])?;
        self.inner.put_i64(
            &format!("{group}/status"),
            &[3],
            &[i64::from(fit.converged), fit.n_iter as i64, fit.n_evaluations as i64],
        )?;
        Ok(())
    }

    /// Record a per-fit failure under the given group label.
    pub fn write_failure(&mut self, group: &str, error: &binfit_core::Error) -> Result<()> {
        self.inner.put_json(&format!("{group}/error"), &error.to_string())
    }

    /// Write a whole campaign: successes as fits, failures as error entries.
    pub fn write_outcomes(&mut self, outcomes: &[FitOutcome]) -> Result<()> {
        for outcome in outcomes {
            match &outcome.result {
                Ok(fit) => self.write_fit(&outcome.label, fit)?,
                Err(e) => self.write_failure(&outcome.label, e)?,
            }
        }
        Ok(())
    }

    /// Write a 1D profile scan: row 0 parameter values, row 1 delta-NLL.
    pub fn write_scan(&mut self, group: &str, name: &str, scan: &ScanResult) -> Result<()> {
        let npoints = scan.values.len();
        let mut flat = Vec::with_capacity(2 * npoints);
        flat.extend_from_slice(&scan.values);
        flat.extend_from_slice(&scan.dnll);
        self.inner.put_f64(&format!("{group}/scan_{name}"), &[2, npoints], &flat)
    }

    /// Write a 2D profile scan grid plus its axis values.
    pub fn write_scan2d(
        &mut self,
        group: &str,
        names: (&str, &str),
        scan: &Scan2dResult,
    ) -> Result<()> {
        let key = format!("{group}/scan2d_{}_{}", names.0, names.1);
        self.inner.put_f64(&format!("{key}_x"), &[scan.x_values.len()], &scan.x_values)?;
        self.inner.put_f64(&format!("{key}_y"), &[scan.y_values.len()], &scan.y_values)?;
        self.inner.put_f64(&key, &[scan.x_values.len(), scan.y_values.len()], &scan.dnll)
    }

    /// Write a contour crossing pair: `[lower, upper, threshold]`.
    pub fn write_contour(
        &mut self,
        group: &str,
        name: &str,
        sigmas: f64,
        contour: &ContourResult,
    ) -> Result<()> {
        self.inner.put_f64(
            &format!("{group}/contour_{name}_{sigmas}"),
            &[3],
            &[contour.lower, contour.upper, contour.threshold],
        )
    }

    /// Write an impact decomposition for one POI.
    pub fn write_impacts(&mut self, group: &str, impacts: &ImpactResult) -> Result<()> {
        let prefix = format!("{group}/impacts_{}", impacts.poi);
        let names: Vec<String> = impacts.per_nuisance.iter().map(|(n, _)| n.clone()).collect();
        let values: Vec<f64> = impacts.per_nuisance.iter().map(|(_, v)| *v).collect();
        self.inner.put_strings(&format!("{prefix}_names"), &names)?;
        self.inner.put_f64(&format!("{prefix}"), &[values.len()], &values)?;
        self.inner.put_f64(&format!("{prefix}_total"), &[1], &[impacts.total])?;

        let group_names: Vec<String> = impacts.groups.iter().map(|(n, _)| n.clone()).collect();
        let group_values: Vec<f64> = impacts.groups.iter().map(|(_, v)| *v).collect();
        self.inner.put_strings(&format!("{prefix}_group_names"), &group_names)?;
        self.inner.put_f64(&format!("{prefix}_groups"), &[group_values.len()], &group_values)?;
        Ok(())
    }

    /// Write global-observable impacts for one POI.
    pub fn write_global_impacts(
        &mut self,
        group: &str,
        poi: &str,
        impacts: &[(String, f64)],
    ) -> Result<()> {
        let prefix = format!("{group}/global_impacts_{poi}");
        let names: Vec<String> = impacts.iter().map(|(n, _)| n.clone()).collect();
        let values: Vec<f64> = impacts.iter().map(|(_, v)| *v).collect();
        self.inner.put_strings(&format!("{prefix}_names"), &names)?;
        self.inner.put_f64(&prefix, &[values.len()], &values)
    }

    /// Finalize the container.
    pub fn finish(self) -> Result<()> {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binfit_core::Error;
    use binfit_tensor::ContainerReader;

    fn demo_fit() -> FitResult {
        FitResult {
            parameter_names: vec!["mu_sig".into(), "scale".into()],
            parameters: vec![1.05, -0.2],
            uncertainties: vec![0.21, 0.95],
            covariance: Some(vec![0.0441, 0.01, 0.01, 0.9025]),
            nll: 3.5,
            nll_saturated: 3.1,
            ndf: 1,
            converged: true,
            n_iter: 5,
            n_evaluations: 17,
        }
    }

    #[test]
    fn test_fit_and_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.bft");

        let fit = demo_fit();
        let scan = ScanResult {
            param: 0,
            values: vec![0.8, 1.0, 1.2],
            dnll: vec![0.5, 0.0, 0.55],
        };
        let contour = ContourResult { lower: 0.84, upper: 1.26, threshold: 0.5 };

        let mut w = ResultWriter::create(&path).unwrap();
        w.write_parameter_names(&fit.parameter_names).unwrap();
        w.write_fit("results", &fit).unwrap();
        w.write_scan("results", "mu_sig", &scan).unwrap();
        w.write_contour("results", "mu_sig", 1.0, &contour).unwrap();
        w.write_failure("results_toy0", &Error::ConvergenceFailure("budget".into())).unwrap();
        w.finish().unwrap();

        let mut r = ContainerReader::open(&path).unwrap();
        assert_eq!(r.get_strings("parmnames").unwrap(), vec!["mu_sig", "scale"]);
        assert_eq!(r.get_f64("results/parms").unwrap().1, vec![1.05, -0.2]);
        assert_eq!(r.get_f64("results/cov").unwrap().0, vec![2, 2]);
        assert_eq!(r.get_f64("results/nll").unwrap().1, vec![3.5, 3.1]);
        assert_eq!(r.get_i64("results/status").unwrap().1, vec![1, 5, 17]);

        let (dims, flat) = r.get_f64("results/scan_mu_sig").unwrap();
        assert_eq!(dims, vec![2, 3]);
        assert_eq!(&flat[..3], &[0.8, 1.0, 1.2]);

        let (_, c) = r.get_f64("results/contour_mu_sig_1").unwrap();
        assert_eq!(c, vec![0.84, 1.26, 0.5]);

        let err: String = r.get_json("results_toy0/error").unwrap();
        assert!(err.contains("budget"));
    }
}
