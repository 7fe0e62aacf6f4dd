//! Hessian evaluation and parameter covariance.
//!
//! The Hessian is built from symmetrized forward differences of the analytic
//! gradient; the covariance is its inverse at the minimum (postfit) or a
//! diagonal constraint-prior matrix (prefit). Indefinite or near-singular
//! matrices are handled by geometric diagonal damping before falling back to
//! LU, and an uninvertible Hessian is reported as [`Error::SingularHessian`],
//! distinct from a convergence failure.

use binfit_core::{Error, Result};
use binfit_tensor::ModelTensor;
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::optimizer::ObjectiveFunction;

/// Hessian via forward differences of the gradient, symmetrized.
pub fn hessian_from_gradient(
    objective: &dyn ObjectiveFunction,
    params: &[f64],
    n_gev: &mut usize,
) -> Result<DMatrix<f64>> {
    let n = params.len();
    let g0 = objective.gradient(params)?;
    *n_gev += 1;

    let mut h = DMatrix::zeros(n, n);
    for j in 0..n {
        let eps = 1e-4 * params[j].abs().max(1.0);
        let mut shifted = params.to_vec();
        shifted[j] += eps;
        let gj = objective.gradient(&shifted)?;
        *n_gev += 1;
        for i in 0..n {
            h[(i, j)] = (gj[i] - g0[i]) / eps;
        }
    }

    // forward differences are not exactly symmetric
    let ht = h.transpose();
    Ok((h + ht) * 0.5)
}

fn diag_scale(h: &DMatrix<f64>) -> f64 {
    let n = h.nrows();
    if n == 0 {
        return 1.0;
    }
    let mean: f64 = (0..n).map(|i| h[(i, i)].abs()).sum::<f64>() / n as f64;
    if mean > 0.0 { mean } else { 1.0 }
}

/// Solve `h * x = rhs` with escalating diagonal damping, LU as a last resort.
pub fn solve_damped(h: &DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    let n = h.nrows();
    let mut damping = diag_scale(h) * 1e-9;
    for attempt in 0..10 {
        let mut damped = h.clone();
        if attempt > 0 {
            for i in 0..n {
                damped[(i, i)] += damping;
            }
            damping *= 10.0;
        }
        if let Some(chol) = Cholesky::new(damped) {
            return Some(chol.solve(rhs));
        }
    }
    h.clone().lu().solve(rhs)
}

/// Invert a Hessian with the same damping ladder; [`Error::SingularHessian`]
/// when every attempt fails.
pub fn invert_hessian(h: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let n = h.nrows();
    let mut damping = diag_scale(h) * 1e-9;
    for attempt in 0..10 {
        let mut damped = h.clone();
        if attempt > 0 {
            for i in 0..n {
                damped[(i, i)] += damping;
            }
            damping *= 10.0;
        }
        if let Some(chol) = Cholesky::new(damped) {
            return Ok(chol.inverse());
        }
    }
    h.clone()
        .lu()
        .try_inverse()
        .ok_or_else(|| Error::SingularHessian("Hessian is not invertible".to_string()))
}

/// Postfit covariance: inverse Hessian at the minimum, row-major.
///
/// Parameters pinned by degenerate bounds (`lo == hi`) are excluded from the
/// Hessian and get zero rows/columns in the embedded result.
pub fn postfit_covariance(
    objective: &dyn ObjectiveFunction,
    params: &[f64],
    bounds: &[(f64, f64)],
) -> Result<Vec<f64>> {
    let n = params.len();
    let free: Vec<usize> = (0..n).filter(|&i| bounds[i].0 != bounds[i].1).collect();

    let mut n_gev = 0usize;
    let full_h = hessian_from_gradient(objective, params, &mut n_gev)?;
    let h_free = DMatrix::from_fn(free.len(), free.len(), |r, c| full_h[(free[r], free[c])]);
    let cov_free = invert_hessian(&h_free)?;

    let mut cov = vec![0.0; n * n];
    for (r, &i) in free.iter().enumerate() {
        for (c, &j) in free.iter().enumerate() {
            cov[i * n + j] = cov_free[(r, c)];
        }
    }
    Ok(cov)
}

/// Prefit covariance: diagonal matrix of constraint-prior variances.
///
/// Constrained systematics have unit prior width; POIs and unconstrained
/// systematics get `unconstrained_err` squared; never-profiled systematics
/// are fixed and get zero.
pub fn prefit_covariance(tensor: &ModelTensor, unconstrained_err: f64) -> Vec<f64> {
    let n = tensor.nparams();
    let npoi = tensor.npoi();
    let mut cov = vec![0.0; n * n];
    for i in 0..n {
        cov[i * n + i] = if i < npoi {
            unconstrained_err * unconstrained_err
        } else {
            let isyst = i - npoi;
            if !tensor.is_profiled(isyst) {
                0.0
            } else if tensor.is_constrained(isyst) {
                1.0
            } else {
                unconstrained_err * unconstrained_err
            }
        };
    }
    cov
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f = 0.5 * (4 x^2 + y^2) + x y, Hessian [[4, 1], [1, 1]]
    struct Quadratic;

    impl ObjectiveFunction for Quadratic {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            let x = params[0];
            let y = params[1];
            Ok(0.5 * (4.0 * x * x + y * y) + x * y)
        }

        fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
            let x = params[0];
            let y = params[1];
            Ok(vec![4.0 * x + y, x + y])
        }
    }

    #[test]
    fn test_hessian_from_gradient() {
        let mut n_gev = 0;
        let h = hessian_from_gradient(&Quadratic, &[0.3, -0.7], &mut n_gev).unwrap();
        assert_relative_eq!(h[(0, 0)], 4.0, epsilon = 1e-8);
        assert_relative_eq!(h[(0, 1)], 1.0, epsilon = 1e-8);
        assert_relative_eq!(h[(1, 0)], 1.0, epsilon = 1e-8);
        assert_relative_eq!(h[(1, 1)], 1.0, epsilon = 1e-8);
        assert_eq!(n_gev, 3);
    }

    #[test]
    fn test_invert_hessian_matches_analytic_inverse() {
        let h = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 1.0]);
        let inv = invert_hessian(&h).unwrap();
        // det = 3, inverse = [[1, -1], [-1, 4]] / 3
        assert_relative_eq!(inv[(0, 0)], 1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(inv[(0, 1)], -1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(inv[(1, 1)], 4.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invert_hessian_singular_reported() {
        let h = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        // the damping ladder regularizes rank deficiency, so force a hard
        // failure with a NaN entry
        let mut bad = h;
        bad[(0, 0)] = f64::NAN;
        assert!(matches!(invert_hessian(&bad), Err(Error::SingularHessian(_))));
    }

    #[test]
    fn test_solve_damped_indefinite_falls_back() {
        // indefinite but nonsingular
        let h = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let rhs = DVector::from_vec(vec![2.0, 3.0]);
        let x = solve_damped(&h, &rhs).unwrap();
        assert_relative_eq!(x[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_postfit_covariance_embeds_pinned_zeros() {
        let bounds = [(f64::NEG_INFINITY, f64::INFINITY), (0.5, 0.5)];
        let cov = postfit_covariance(&Quadratic, &[0.0, 0.5], &bounds).unwrap();
        // only x is free: H_ff = [4], cov = [0.25]
        assert_relative_eq!(cov[0], 0.25, epsilon = 1e-6);
        assert_eq!(cov[1], 0.0);
        assert_eq!(cov[2], 0.0);
        assert_eq!(cov[3], 0.0);
    }

    #[test]
    fn test_covariance_symmetry_and_positive_diagonal() {
        let bounds = [(f64::NEG_INFINITY, f64::INFINITY); 2];
        let cov = postfit_covariance(&Quadratic, &[0.0, 0.0], &bounds).unwrap();
        assert_relative_eq!(cov[1], cov[2], epsilon = 1e-9);
        assert!(cov[0] > 0.0 && cov[3] > 0.0);
    }
}
