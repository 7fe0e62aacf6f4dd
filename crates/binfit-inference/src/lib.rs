//! Fitting engine for binned maximum-likelihood template fits.
//!
//! Consumes the canonical model tensor from `binfit-tensor` and provides the
//! full inference chain:
//!
//! - [`likelihood::LikelihoodSurface`]: Poisson or chi-square NLL with
//!   multiplicative log-normal systematic responses, smooth asymmetric
//!   interpolation, closed-form Barlow-Beeston-lite profiling, and an
//!   analytic gradient
//! - [`optimizer::NewtonOptimizer`]: bounded damped-Newton minimization
//! - [`covariance`]: postfit (inverse Hessian) and prefit (constraint prior)
//!   covariance
//! - [`scan`]: 1D/2D profile scans and contour crossings
//! - [`impacts`]: per-nuisance and grouped impact decomposition
//! - [`toys`]: seeded Asimov / frequentist / bootstrap / Bayesian pseudo-data
//! - [`fitter::Fitter`]: the campaign session (Asimov / data / toy schedule
//!   with per-toy failure isolation)
//! - [`results::ResultWriter`]: persists outcomes in the container format

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod covariance;
pub mod fitter;
pub mod impacts;
pub mod likelihood;
pub mod optimizer;
pub mod results;
pub mod scan;
pub mod toys;

pub use covariance::{invert_hessian, postfit_covariance, prefit_covariance};
pub use fitter::{FitConfig, FitOutcome, Fitter};
pub use impacts::{global_impacts, impacts, ImpactResult};
pub use likelihood::{LikelihoodOptions, LikelihoodSurface};
pub use optimizer::{NewtonOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use results::ResultWriter;
pub use scan::{
    contour_scan, contour_scan2d, contour_threshold, nll_scan, nll_scan2d, ContourResult,
    Scan2dResult, ScanResult,
};
pub use toys::ToyGenerator;
