//! Bounded Newton minimization.
//!
//! Each iteration solves `H * dx = -g` on the subset of parameters that are
//! free to move (not pinned at an active bound), with geometric diagonal
//! damping when the Hessian is not positive definite, followed by a
//! backtracking line search. Box bounds are enforced by projection; a bound
//! with `lo == hi` pins the parameter exactly, which is how fixed parameters
//! and scan points are expressed.

use std::fmt;

use binfit_core::Result;
use nalgebra::{DMatrix, DVector};

use crate::covariance::{hessian_from_gradient, solve_damped};

/// Configuration for the Newton minimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of Newton iterations.
    pub max_iter: u64,
    /// Convergence tolerance on the projected gradient infinity norm.
    pub tol: f64,
    /// Convergence tolerance on the step infinity norm.
    pub step_tol: f64,
    /// Maximum backtracking halvings per line search.
    pub max_linesearch: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 100, tol: 1e-6, step_tol: 1e-12, max_linesearch: 40 }
    }
}

/// Result of a minimization.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best-fit parameters.
    pub parameters: Vec<f64>,
    /// Function value at the minimum.
    pub fval: f64,
    /// Number of Newton iterations.
    pub n_iter: u64,
    /// Number of objective evaluations.
    pub n_fev: usize,
    /// Number of gradient evaluations.
    pub n_gev: usize,
    /// Convergence status; a `false` here must be surfaced by callers.
    pub converged: bool,
    /// Termination message.
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Objective function interface for the minimizer.
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate the function at the given parameters.
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at the given parameters (central differences if not overridden).
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];
        for i in 0..n {
            let eps = 1e-8 * params[i].abs().max(1.0);

            let mut params_plus = params.to_vec();
            params_plus[i] += eps;
            let f_plus = self.eval(&params_plus)?;

            let mut params_minus = params.to_vec();
            params_minus[i] -= eps;
            let f_minus = self.eval(&params_minus)?;

            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }
}

/// Clamp parameters into their box bounds.
pub fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

const BOUND_EPS: f64 = 1e-12;

/// Zero gradient components that push against an active bound.
fn project_gradient(grad: &mut [f64], params: &[f64], bounds: &[(f64, f64)]) {
    for (i, (&x, &(lo, hi))) in params.iter().zip(bounds.iter()).enumerate() {
        if x <= lo + BOUND_EPS && grad[i] > 0.0 {
            grad[i] = 0.0;
        }
        if x >= hi - BOUND_EPS && grad[i] < 0.0 {
            grad[i] = 0.0;
        }
    }
}

/// Indices allowed to move this iteration: inside their bounds, or at a bound
/// the (negative-gradient) descent direction points away from.
fn free_set(params: &[f64], grad: &[f64], bounds: &[(f64, f64)]) -> Vec<usize> {
    let mut free = Vec::with_capacity(params.len());
    for (i, (&x, &(lo, hi))) in params.iter().zip(bounds.iter()).enumerate() {
        if lo == hi {
            continue;
        }
        if x <= lo + BOUND_EPS && grad[i] >= 0.0 {
            continue;
        }
        if x >= hi - BOUND_EPS && grad[i] <= 0.0 {
            continue;
        }
        free.push(i);
    }
    free
}

/// Newton minimizer with box constraints.
pub struct NewtonOptimizer {
    config: OptimizerConfig,
}

impl NewtonOptimizer {
    /// Create a minimizer with the given configuration.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` from `init_params` subject to box `bounds`.
    ///
    /// Returns `Ok` with `converged == false` when the iteration budget is
    /// exhausted or no descent step exists; callers decide whether that is a
    /// hard failure. Holds no state across calls, so repeated invocations
    /// with different starting points (one per toy) are independent.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if init_params.len() != bounds.len() {
            return Err(binfit_core::Error::Configuration(format!(
                "Parameter and bounds length mismatch: {} != {}",
                init_params.len(),
                bounds.len()
            )));
        }

        let mut x = clamp_params(init_params, bounds);
        let mut n_fev = 0usize;
        let mut n_gev = 0usize;

        let mut fval = objective.eval(&x)?;
        n_fev += 1;

        for iter in 0..self.config.max_iter {
            let mut grad = objective.gradient(&x)?;
            n_gev += 1;
            project_gradient(&mut grad, &x, bounds);

            let gnorm = grad.iter().fold(0.0f64, |m, g| m.max(g.abs()));
            if gnorm < self.config.tol {
                return Ok(OptimizationResult {
                    parameters: x,
                    fval,
                    n_iter: iter,
                    n_fev,
                    n_gev,
                    converged: true,
                    message: "Projected gradient below tolerance".to_string(),
                });
            }

            let free = free_set(&x, &grad, bounds);
            if free.is_empty() {
                return Ok(OptimizationResult {
                    parameters: x,
                    fval,
                    n_iter: iter,
                    n_fev,
                    n_gev,
                    converged: true,
                    message: "All parameters pinned at bounds".to_string(),
                });
            }

            let full_h = hessian_from_gradient(objective, &x, &mut n_gev)?;
            let h_free = DMatrix::from_fn(free.len(), free.len(), |r, c| full_h[(free[r], free[c])]);
            let g_free = DVector::from_fn(free.len(), |r, _| grad[free[r]]);

            let step_free = match solve_damped(&h_free, &(-&g_free)) {
                Some(step) => step,
                None => {
                    return Ok(OptimizationResult {
                        parameters: x,
                        fval,
                        n_iter: iter,
                        n_fev,
                        n_gev,
                        converged: false,
                        message: "Newton system could not be solved".to_string(),
                    });
                }
            };

            // descent direction w.r.t. the free-subset gradient
            let slope: f64 = g_free.dot(&step_free);

            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..self.config.max_linesearch {
                let mut candidate = x.clone();
                for (r, &i) in free.iter().enumerate() {
                    candidate[i] += alpha * step_free[r];
                }
                let candidate = clamp_params(&candidate, bounds);
                let f_new = objective.eval(&candidate)?;
                n_fev += 1;
                // Armijo condition with projection-aware fallback on plain decrease
                if f_new.is_finite() && (f_new <= fval + 1e-4 * alpha * slope || f_new < fval) {
                    accepted = Some((candidate, f_new));
                    break;
                }
                alpha *= 0.5;
            }

            let (x_new, f_new) = match accepted {
                Some(pair) => pair,
                None => {
                    return Ok(OptimizationResult {
                        parameters: x,
                        fval,
                        n_iter: iter,
                        n_fev,
                        n_gev,
                        converged: false,
                        message: "Line search failed to find a descent step".to_string(),
                    });
                }
            };

            let step_norm =
                x.iter().zip(&x_new).fold(0.0f64, |m, (&a, &b)| m.max((a - b).abs()));
            x = x_new;
            fval = f_new;

            if step_norm < self.config.step_tol {
                return Ok(OptimizationResult {
                    parameters: x,
                    fval,
                    n_iter: iter + 1,
                    n_fev,
                    n_gev,
                    converged: true,
                    message: "Step size below tolerance".to_string(),
                });
            }
        }

        Ok(OptimizationResult {
            parameters: x,
            fval,
            n_iter: self.config.max_iter,
            n_fev,
            n_gev,
            converged: false,
            message: "Maximum iterations reached".to_string(),
        })
    }
}

impl Default for NewtonOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}
