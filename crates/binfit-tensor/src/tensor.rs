//! The canonical model tensor artifact.
//!
//! Built once by [`crate::builder::ModelTensorBuilder`] and thereafter
//! immutable; the fitting engine only ever reads it. Processes are ordered
//! signals-first, systematics in fixed blocks (nuisances of interest, then
//! other unconstrained, then standard Gaussian-constrained, then no-profile),
//! each block sorted by name.

use crate::axis::ChannelInfo;
use crate::sparse::SparseArray2;

/// Named group of systematics with resolved tensor indices.
#[derive(Debug, Clone, PartialEq)]
pub struct SystGroup {
    /// Group name.
    pub name: String,
    /// Indices into the canonical systematic list.
    pub indices: Vec<usize>,
}

/// Normalization tensor storage: `nbins x nproc`.
#[derive(Debug, Clone, PartialEq)]
pub enum NormStorage {
    /// Row-major dense array.
    Dense(Vec<f64>),
    /// Sparse coordinate list, sorted row-major over `(bin, proc)`.
    Sparse(SparseArray2),
}

/// Log-effect tensor storage.
///
/// Dense layout is `nbins x nproc x nsyst` for a symmetric tensor and
/// `nbins x nproc x 2 x nsyst` otherwise (slice 0 = average, slice 1 =
/// half-difference). The sparse layout indexes `(norm_entry, syst_slot)`
/// where `norm_entry` points into the sparse normalization entries and the
/// half-difference of systematic `s` occupies slot `nsyst + s`.
#[derive(Debug, Clone, PartialEq)]
pub enum LogkStorage {
    /// Row-major dense array.
    Dense(Vec<f64>),
    /// Sparse coordinate list, sorted row-major over `(norm_entry, slot)`.
    Sparse(SparseArray2),
}

/// Canonical numeric artifact consumed by the fitting engine.
#[derive(Debug, Clone)]
pub struct ModelTensor {
    /// Channel metadata (axes, bin offsets).
    pub channels: Vec<ChannelInfo>,
    /// Total bin count across channels.
    pub nbins: usize,
    /// Process names, signals first.
    pub procs: Vec<String>,
    /// Number of signal processes (prefix of `procs`).
    pub nsignals: usize,
    /// Systematic names in canonical block order.
    pub systs: Vec<String>,
    /// Nuisance-of-interest subset (first block of `systs`).
    pub systsnoi: Vec<String>,
    /// Unconstrained subset including nuisances of interest (first two blocks).
    pub systsnoconstraint: Vec<String>,
    /// Never-profiled subset (final block of `systs`).
    pub systsnoprofile: Vec<String>,
    /// Gaussian constraint weight per systematic: 0 for unconstrained, 1 otherwise.
    pub constraintweights: Vec<f64>,
    /// Systematic groups for impact aggregation.
    pub systgroups: Vec<SystGroup>,
    /// Nuisance-of-interest groups.
    pub noigroups: Vec<SystGroup>,
    /// Barlow-Beeston shape parameter `k = (sum w)^2 / sum w^2` per bin.
    pub kstat: Vec<f64>,
    /// Observed counts, if registered.
    pub data_obs: Option<Vec<f64>>,
    /// Pseudo-data set names.
    pub pseudodata_names: Vec<String>,
    /// Pseudo-data matrix, row-major `nbins x pseudodata_names.len()`.
    pub pseudodata: Vec<f64>,
    /// Inverted external data covariance (`nbins x nbins`), for chi-square fits.
    pub data_cov_inv: Option<Vec<f64>>,
    /// True when every systematic is symmetrized (single slice per systematic).
    pub symmetric: bool,
    /// Nominal yield tensor.
    pub norm: NormStorage,
    /// Log-effect tensor.
    pub logk: LogkStorage,
}

impl ModelTensor {
    /// Number of processes.
    pub fn nproc(&self) -> usize {
        self.procs.len()
    }

    /// Number of systematics.
    pub fn nsyst(&self) -> usize {
        self.systs.len()
    }

    /// Number of parameters of interest (one signal strength per signal).
    pub fn npoi(&self) -> usize {
        self.nsignals
    }

    /// Total fit parameter count: POIs then all systematics.
    pub fn nparams(&self) -> usize {
        self.npoi() + self.nsyst()
    }

    /// Number of profiled systematics (the no-profile block is the tail).
    pub fn nsyst_profiled(&self) -> usize {
        self.nsyst() - self.systsnoprofile.len()
    }

    /// True if systematic `isyst` is profiled (not held fixed).
    pub fn is_profiled(&self, isyst: usize) -> bool {
        isyst < self.nsyst_profiled()
    }

    /// True if systematic `isyst` carries a Gaussian constraint and is profiled.
    pub fn is_constrained(&self, isyst: usize) -> bool {
        self.constraintweights[isyst] != 0.0 && self.is_profiled(isyst)
    }

    /// Fit parameter names: signal strengths then systematics.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.procs[..self.nsignals].iter().map(|p| format!("mu_{p}")).collect();
        names.extend(self.systs.iter().cloned());
        names
    }

    /// Index of a fit parameter by name.
    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameter_names().iter().position(|n| n == name)
    }

    /// Nominal yield at `(bin, proc)` regardless of storage.
    pub fn norm_at(&self, bin: usize, proc: usize) -> f64 {
        match &self.norm {
            NormStorage::Dense(v) => v[bin * self.nproc() + proc],
            NormStorage::Sparse(s) => s.get(bin, proc),
        }
    }

    /// Log-effect at `(bin, proc, half, syst)`; `half` 0 = average, 1 = half-difference.
    ///
    /// For a symmetric tensor the half-difference is identically zero.
    pub fn logk_at(&self, bin: usize, proc: usize, half: usize, isyst: usize) -> f64 {
        let nsyst = self.nsyst();
        if self.symmetric && half == 1 {
            return 0.0;
        }
        match &self.logk {
            LogkStorage::Dense(v) => {
                if self.symmetric {
                    v[(bin * self.nproc() + proc) * nsyst + isyst]
                } else {
                    v[((bin * self.nproc() + proc) * 2 + half) * nsyst + isyst]
                }
            }
            LogkStorage::Sparse(s) => {
                let norm_sparse = match &self.norm {
                    NormStorage::Sparse(n) => n,
                    NormStorage::Dense(_) => return 0.0,
                };
                match norm_sparse.position(bin, proc) {
                    Some(entry) => s.get(entry, half * nsyst + isyst),
                    None => 0.0,
                }
            }
        }
    }

    /// Observed or pseudo-data vector for a fit.
    ///
    /// `None` selects the observed data; a name selects the pseudo-data set
    /// registered under that name.
    pub fn observation(&self, pseudodata: Option<&str>) -> Option<Vec<f64>> {
        match pseudodata {
            None => self.data_obs.clone(),
            Some(name) => {
                let col = self.pseudodata_names.iter().position(|n| n == name)?;
                let npd = self.pseudodata_names.len();
                Some((0..self.nbins).map(|b| self.pseudodata[b * npd + col]).collect())
            }
        }
    }
}
