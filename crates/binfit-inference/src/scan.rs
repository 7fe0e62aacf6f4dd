//! Profile-likelihood scans and confidence contours.
//!
//! A scanned parameter is held fixed by collapsing its bounds to a point and
//! re-minimizing over everything else, warm-started from the neighbouring
//! scan point. Contour search runs bisection on the profiled delta-NLL minus
//! a chi-square-derived threshold along each direction from the best fit.

use std::f64::consts::SQRT_2;

use binfit_core::{Error, Result};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::erf;

use crate::optimizer::{NewtonOptimizer, ObjectiveFunction};

/// Result of a 1D profile scan.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Index of the scanned parameter.
    pub param: usize,
    /// Scanned parameter values.
    pub values: Vec<f64>,
    /// Profiled NLL minus the best-fit NLL at each value.
    pub dnll: Vec<f64>,
}

/// Result of a 2D profile scan.
#[derive(Debug, Clone)]
pub struct Scan2dResult {
    /// Indices of the scanned parameter pair.
    pub params: (usize, usize),
    /// Grid values of the first parameter.
    pub x_values: Vec<f64>,
    /// Grid values of the second parameter.
    pub y_values: Vec<f64>,
    /// Profiled delta-NLL, row-major over `(x, y)`.
    pub dnll: Vec<f64>,
}

/// Crossing points of the profiled delta-NLL with a confidence threshold.
///
/// A side is `NaN` when no crossing exists inside the parameter's bounds.
#[derive(Debug, Clone, Copy)]
pub struct ContourResult {
    /// Crossing below the best-fit value.
    pub lower: f64,
    /// Crossing above the best-fit value.
    pub upper: f64,
    /// Delta-NLL threshold that was crossed.
    pub threshold: f64,
}

/// Delta-NLL threshold for a confidence level given in standard deviations,
/// via the one-degree-of-freedom chi-square quantile.
pub fn contour_threshold(sigmas: f64) -> Result<f64> {
    if !(sigmas > 0.0) {
        return Err(Error::Configuration(format!(
            "Confidence level must be a positive number of standard deviations, got {sigmas}"
        )));
    }
    let cl = erf(sigmas / SQRT_2);
    let chi2 = ChiSquared::new(1.0)
        .map_err(|e| Error::Configuration(format!("Chi-square quantile setup failed: {e}")))?;
    Ok(0.5 * chi2.inverse_cdf(cl))
}

/// Minimize with `param` fixed at `value`; returns the profiled NLL and the
/// minimizing parameter vector.
fn profile_at(
    objective: &dyn ObjectiveFunction,
    optimizer: &NewtonOptimizer,
    bounds: &[(f64, f64)],
    start: &[f64],
    param: usize,
    value: f64,
) -> Result<(f64, Vec<f64>)> {
    let mut fixed_bounds = bounds.to_vec();
    fixed_bounds[param] = (value, value);
    let mut init = start.to_vec();
    init[param] = value;
    let res = optimizer.minimize(objective, &init, &fixed_bounds)?;
    if !res.converged {
        return Err(Error::ConvergenceFailure(format!(
            "Profile fit at parameter {param} = {value} failed: {}",
            res.message
        )));
    }
    Ok((res.fval, res.parameters))
}

fn linspace(center: f64, halfwidth: f64, points: usize) -> Vec<f64> {
    if points == 1 {
        return vec![center];
    }
    let lo = center - halfwidth;
    let step = 2.0 * halfwidth / (points - 1) as f64;
    (0..points).map(|i| lo + step * i as f64).collect()
}

/// 1D profile scan over `points` values spanning best fit +- `range * sigma`.
///
/// Points are visited center-outward so each profile fit warm-starts from its
/// inner neighbour.
pub fn nll_scan(
    objective: &dyn ObjectiveFunction,
    optimizer: &NewtonOptimizer,
    bounds: &[(f64, f64)],
    best_params: &[f64],
    best_nll: f64,
    param: usize,
    sigma: f64,
    points: usize,
    range: f64,
) -> Result<ScanResult> {
    let values = linspace(best_params[param], range * sigma, points);
    let mut dnll = vec![0.0; points];

    let center = points / 2;
    let mut up_start = best_params.to_vec();
    for i in center..points {
        let (fval, minimum) =
            profile_at(objective, optimizer, bounds, &up_start, param, values[i])?;
        dnll[i] = fval - best_nll;
        up_start = minimum;
    }
    let mut down_start = best_params.to_vec();
    for i in (0..center).rev() {
        let (fval, minimum) =
            profile_at(objective, optimizer, bounds, &down_start, param, values[i])?;
        dnll[i] = fval - best_nll;
        down_start = minimum;
    }

    Ok(ScanResult { param, values, dnll })
}

/// 2D profile scan over a `points x points` grid.
pub fn nll_scan2d(
    objective: &dyn ObjectiveFunction,
    optimizer: &NewtonOptimizer,
    bounds: &[(f64, f64)],
    best_params: &[f64],
    best_nll: f64,
    params: (usize, usize),
    sigmas: (f64, f64),
    points: usize,
    range: f64,
) -> Result<Scan2dResult> {
    let (px, py) = params;
    if px == py {
        return Err(Error::Configuration(
            "2D scan requires two distinct parameters".to_string(),
        ));
    }
    let x_values = linspace(best_params[px], range * sigmas.0, points);
    let y_values = linspace(best_params[py], range * sigmas.1, points);
    let mut dnll = vec![0.0; points * points];

    let mut row_start = best_params.to_vec();
    for (ix, &x) in x_values.iter().enumerate() {
        let mut start = row_start.clone();
        for (iy, &y) in y_values.iter().enumerate() {
            let mut fixed_bounds = bounds.to_vec();
            fixed_bounds[px] = (x, x);
            fixed_bounds[py] = (y, y);
            let mut init = start.clone();
            init[px] = x;
            init[py] = y;
            let res = optimizer.minimize(objective, &init, &fixed_bounds)?;
            if !res.converged {
                return Err(Error::ConvergenceFailure(format!(
                    "Profile fit at grid point ({x}, {y}) failed: {}",
                    res.message
                )));
            }
            dnll[ix * points + iy] = res.fval - best_nll;
            start = res.parameters.clone();
            if iy == 0 {
                row_start = res.parameters;
            }
        }
    }

    Ok(Scan2dResult { params, x_values, y_values, dnll })
}

/// Find where the profiled delta-NLL crosses the `sigmas`-level threshold on
/// either side of the best fit.
pub fn contour_scan(
    objective: &dyn ObjectiveFunction,
    optimizer: &NewtonOptimizer,
    bounds: &[(f64, f64)],
    best_params: &[f64],
    best_nll: f64,
    param: usize,
    sigma: f64,
    sigmas: f64,
) -> Result<ContourResult> {
    let threshold = contour_threshold(sigmas)?;
    let step = if sigma > 0.0 { sigmas * sigma } else { 1.0 };
    let center = best_params[param];
    let (lo_bound, hi_bound) = bounds[param];

    let mut crossings = [f64::NAN; 2];
    for (side, direction) in [(0usize, -1.0), (1usize, 1.0)] {
        let limit = if direction < 0.0 { lo_bound } else { hi_bound };
        let mut start = best_params.to_vec();

        // expand outward until the threshold is exceeded
        let mut inner = center;
        let mut outer = f64::NAN;
        let mut width = step;
        for _ in 0..32 {
            let mut x = center + direction * width;
            let mut at_limit = false;
            if (direction < 0.0 && x <= limit) || (direction > 0.0 && x >= limit) {
                x = limit;
                at_limit = true;
            }
            let (fval, minimum) = profile_at(objective, optimizer, bounds, &start, param, x)?;
            start = minimum;
            if fval - best_nll > threshold {
                outer = x;
                break;
            }
            inner = x;
            if at_limit {
                break;
            }
            width *= 1.6;
        }
        if outer.is_nan() {
            log::warn!(
                "No {} crossing for parameter {param} within bounds; contour side undefined",
                if direction < 0.0 { "downward" } else { "upward" }
            );
            continue;
        }

        // bisect the bracket
        let tol = 1e-4 * step.max(1e-12);
        for _ in 0..100 {
            if (outer - inner).abs() < tol {
                break;
            }
            let mid = 0.5 * (inner + outer);
            let (fval, minimum) = profile_at(objective, optimizer, bounds, &start, param, mid)?;
            start = minimum;
            if fval - best_nll > threshold {
                outer = mid;
            } else {
                inner = mid;
            }
        }
        crossings[side] = 0.5 * (inner + outer);
    }

    Ok(ContourResult { lower: crossings[0], upper: crossings[1], threshold })
}

/// 2D confidence-contour tracing.
///
/// Deliberately unsupported: callers get an explicit error instead of a
/// silently approximated boundary.
pub fn contour_scan2d(
    _objective: &dyn ObjectiveFunction,
    _optimizer: &NewtonOptimizer,
    _bounds: &[(f64, f64)],
    _best_params: &[f64],
    _params: (usize, usize),
    _sigmas: f64,
) -> Result<Scan2dResult> {
    Err(Error::Unsupported("2D contour tracing is not implemented".to_string()))
}
