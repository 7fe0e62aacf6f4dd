//! Nuisance-parameter impact decomposition.
//!
//! Impacts are derived from the postfit covariance without refitting: the
//! shift of a POI induced by a one-sigma excursion of nuisance `k` is
//! `cov[poi, k] / sqrt(cov[k, k])`, and the variance contribution of a
//! nuisance group follows from the Schur contraction of the corresponding
//! covariance sub-block.

use binfit_core::{Error, Result};
use binfit_tensor::ModelTensor;
use nalgebra::{DMatrix, DVector};

/// Impact decomposition for one POI.
#[derive(Debug, Clone)]
pub struct ImpactResult {
    /// Parameter-of-interest name.
    pub poi: String,
    /// Total postfit uncertainty of the POI.
    pub total: f64,
    /// Per-systematic impacts, in canonical systematic order.
    pub per_nuisance: Vec<(String, f64)>,
    /// Grouped impacts (square root of the group variance contribution).
    pub groups: Vec<(String, f64)>,
}

/// Decompose the uncertainty of POI `poi` from the postfit covariance
/// (row-major, dimension `tensor.nparams()`).
pub fn impacts(tensor: &ModelTensor, cov: &[f64], poi: usize) -> Result<ImpactResult> {
    let n = tensor.nparams();
    let npoi = tensor.npoi();
    if cov.len() != n * n {
        return Err(Error::Configuration(format!(
            "Covariance has {} entries, expected {}",
            cov.len(),
            n * n
        )));
    }
    if poi >= npoi {
        return Err(Error::Configuration(format!("Parameter {poi} is not a POI")));
    }

    let names = tensor.parameter_names();
    let total = cov[poi * n + poi].max(0.0).sqrt();

    let per_nuisance = tensor
        .systs
        .iter()
        .enumerate()
        .map(|(isyst, name)| {
            let k = npoi + isyst;
            let var = cov[k * n + k];
            let impact = if var > 0.0 { cov[poi * n + k] / var.sqrt() } else { 0.0 };
            (name.clone(), impact)
        })
        .collect();

    let mut groups = Vec::with_capacity(tensor.systgroups.len());
    for group in &tensor.systgroups {
        // pinned members carry zero variance and are excluded from the block
        let members: Vec<usize> = group
            .indices
            .iter()
            .map(|&isyst| npoi + isyst)
            .filter(|&k| cov[k * n + k] > 0.0)
            .collect();
        if members.is_empty() {
            groups.push((group.name.clone(), 0.0));
            continue;
        }
        let block = DMatrix::from_fn(members.len(), members.len(), |r, c| {
            cov[members[r] * n + members[c]]
        });
        let cross = DVector::from_fn(members.len(), |r, _| cov[poi * n + members[r]]);
        let solved = block.clone().lu().solve(&cross).ok_or_else(|| {
            Error::SingularHessian(format!(
                "Covariance sub-block for group '{}' is singular",
                group.name
            ))
        })?;
        let variance = cross.dot(&solved).max(0.0);
        groups.push((group.name.clone(), variance.sqrt()));
    }

    Ok(ImpactResult { poi: names[poi].clone(), total, per_nuisance, groups })
}

/// Global-observable impacts: sensitivity of the POI estimate to the global
/// observable of each constrained systematic (unit prior width), zero for
/// unconstrained ones.
pub fn global_impacts(tensor: &ModelTensor, cov: &[f64], poi: usize) -> Result<Vec<(String, f64)>> {
    let n = tensor.nparams();
    let npoi = tensor.npoi();
    if cov.len() != n * n {
        return Err(Error::Configuration(format!(
            "Covariance has {} entries, expected {}",
            cov.len(),
            n * n
        )));
    }
    if poi >= npoi {
        return Err(Error::Configuration(format!("Parameter {poi} is not a POI")));
    }
    Ok(tensor
        .systs
        .iter()
        .enumerate()
        .map(|(isyst, name)| {
            let k = npoi + isyst;
            (name.clone(), cov[poi * n + k] * tensor.constraintweights[isyst])
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use binfit_tensor::{LogkStorage, NormStorage, SystGroup};

    fn tensor_with_two_systs() -> ModelTensor {
        ModelTensor {
            channels: vec![],
            nbins: 2,
            procs: vec!["sig".into()],
            nsignals: 1,
            systs: vec!["a".into(), "b".into()],
            systsnoi: vec![],
            systsnoconstraint: vec![],
            systsnoprofile: vec![],
            constraintweights: vec![1.0, 0.0],
            systgroups: vec![
                SystGroup { name: "a".into(), indices: vec![0] },
                SystGroup { name: "all".into(), indices: vec![0, 1] },
            ],
            noigroups: vec![],
            kstat: vec![1.0, 1.0],
            data_obs: None,
            pseudodata_names: vec![],
            pseudodata: vec![],
            data_cov_inv: None,
            symmetric: true,
            norm: NormStorage::Dense(vec![1.0, 1.0]),
            logk: LogkStorage::Dense(vec![0.0; 4]),
        }
    }

    #[test]
    fn test_per_nuisance_impacts() {
        let t = tensor_with_two_systs();
        // params: mu, a, b
        let cov = vec![
            0.04, 0.01, 0.002, //
            0.01, 1.0, 0.0, //
            0.002, 0.0, 0.25,
        ];
        let result = impacts(&t, &cov, 0).unwrap();

        assert_eq!(result.poi, "mu_sig");
        assert_relative_eq!(result.total, 0.2, epsilon = 1e-12);
        assert_relative_eq!(result.per_nuisance[0].1, 0.01, epsilon = 1e-12);
        assert_relative_eq!(result.per_nuisance[1].1, 0.002 / 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_group_impacts_reduce_to_single_member() {
        let t = tensor_with_two_systs();
        let cov = vec![
            0.04, 0.01, 0.002, //
            0.01, 1.0, 0.0, //
            0.002, 0.0, 0.25,
        ];
        let result = impacts(&t, &cov, 0).unwrap();

        // single-member group equals the per-nuisance impact magnitude
        let single = result.groups.iter().find(|(n, _)| n == "a").unwrap().1;
        assert_relative_eq!(single, 0.01, epsilon = 1e-12);

        // uncorrelated members add in quadrature
        let all = result.groups.iter().find(|(n, _)| n == "all").unwrap().1;
        let expect = (0.01f64.powi(2) + (0.002f64 / 0.5).powi(2)).sqrt();
        assert_relative_eq!(all, expect, epsilon = 1e-12);
    }

    #[test]
    fn test_global_impacts_only_constrained() {
        let t = tensor_with_two_systs();
        let cov = vec![
            0.04, 0.01, 0.002, //
            0.01, 1.0, 0.0, //
            0.002, 0.0, 0.25,
        ];
        let result = global_impacts(&t, &cov, 0).unwrap();
        assert_relative_eq!(result[0].1, 0.01, epsilon = 1e-12);
        assert_eq!(result[1].1, 0.0);
    }

    #[test]
    fn test_non_poi_rejected() {
        let t = tensor_with_two_systs();
        let cov = vec![0.0; 9];
        assert!(matches!(impacts(&t, &cov, 1), Err(Error::Configuration(_))));
        assert!(matches!(global_impacts(&t, &cov, 2), Err(Error::Configuration(_))));
    }
}
