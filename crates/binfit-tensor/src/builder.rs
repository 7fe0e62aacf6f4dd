//! Model tensor builder.
//!
//! Accumulates per-channel/per-process nominal yields, variances and
//! systematic log-ratio templates, then finalizes them into the canonical
//! [`ModelTensor`]. Registration is arena-indexed: channels, processes and
//! systematics get integer ids on first sight and all per-template payloads
//! are appended to flat buffers that are sorted exactly once at finalize
//! time.

use std::collections::{BTreeMap, HashMap, HashSet};

use binfit_core::{Error, Result};
use nalgebra::DMatrix;

use crate::axis::{bin_count, Axis, ChannelInfo};
use crate::sparse::SparseArray2;
use crate::tensor::{LogkStorage, ModelTensor, NormStorage, SystGroup};

/// Numerical floor for the log-effect when nominal and varied yields have
/// opposite sign: `ln(1e-3)`.
pub const LOGK_EPSILON: f64 = -6.907_755_278_982_137;

/// Minimal histogram interface required from the histogram provider.
pub trait Histogram {
    /// Axis definitions; must match the channel the histogram is registered to.
    fn axes(&self) -> &[Axis];
    /// Flattened bin values (row-major over the axes).
    fn values(&self) -> Vec<f64>;
    /// Flattened bin variances, if the provider tracks them.
    fn variances(&self) -> Option<Vec<f64>>;
}

/// Plain in-memory histogram.
#[derive(Debug, Clone)]
pub struct ArrayHistogram {
    axes: Vec<Axis>,
    values: Vec<f64>,
    variances: Option<Vec<f64>>,
}

impl ArrayHistogram {
    /// Create a histogram; the value count must match the axis bin product.
    pub fn new(axes: Vec<Axis>, values: Vec<f64>) -> Result<Self> {
        if values.len() != bin_count(&axes) {
            return Err(Error::Configuration(format!(
                "Histogram value count {} does not match axis bin count {}",
                values.len(),
                bin_count(&axes)
            )));
        }
        Ok(Self { axes, values, variances: None })
    }

    /// Attach per-bin variances.
    pub fn with_variances(mut self, variances: Vec<f64>) -> Result<Self> {
        if variances.len() != self.values.len() {
            return Err(Error::Configuration(format!(
                "Histogram variance count {} does not match value count {}",
                variances.len(),
                self.values.len()
            )));
        }
        self.variances = Some(variances);
        Ok(self)
    }
}

impl Histogram for ArrayHistogram {
    fn axes(&self) -> &[Axis] {
        &self.axes
    }
    fn values(&self) -> Vec<f64> {
        self.values.clone()
    }
    fn variances(&self) -> Option<Vec<f64>> {
        self.variances.clone()
    }
}

/// How an up/down variation pair is combined into stored tensor slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Symmetrization {
    /// Mean of up and mirrored down log-effects.
    #[default]
    Average,
    /// Per bin, whichever of up/down has the larger magnitude.
    Conservative,
    /// Average effect plus a derived half-difference systematic
    /// (piecewise-linear dependence on the nuisance parameter).
    Linear,
    /// Like `Linear` but the half-difference is scaled by `sqrt(3)`
    /// (quadratic dependence on the nuisance parameter).
    Quadratic,
    /// No symmetrization: store average and half-difference as two tensor
    /// slices; makes the whole tensor asymmetric.
    None,
}

/// Registration options for a systematic.
#[derive(Debug, Clone)]
pub struct SystematicOptions {
    /// Multiplicative scale applied to the log-effect.
    pub kfactor: f64,
    /// Up/down combination policy.
    pub symmetrize: Symmetrization,
    /// Profiled during the fit; `false` holds the parameter at nominal.
    pub profile: bool,
    /// Nuisance of interest: unconstrained, reported as an additional output.
    pub noi: bool,
    /// Gaussian-constrained (ignored when `noi` or `!profile`).
    pub constrained: bool,
    /// Impact-aggregation groups; defaults to the systematic's own name.
    pub groups: Option<Vec<String>>,
}

impl Default for SystematicOptions {
    fn default() -> Self {
        Self {
            kfactor: 1.0,
            symmetrize: Symmetrization::Average,
            profile: true,
            noi: false,
            constrained: true,
            groups: None,
        }
    }
}

/// A systematic variation input: a single mirrored template or an up/down pair.
pub enum Variation<'a, H: Histogram> {
    /// One histogram; the down variation is the mirrored up log-effect.
    Mirror(&'a H),
    /// Explicit up and down histograms.
    UpDown(&'a H, &'a H),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SystClass {
    Noi,
    NoConstraint,
    Standard,
    NoProfile,
}

#[derive(Debug)]
struct ChannelEntry {
    name: String,
    axes: Vec<Axis>,
    nbins: usize,
    sumw2: Vec<f64>,
}

#[derive(Debug)]
struct ProcessRec {
    name: String,
    signal: bool,
}

#[derive(Debug)]
struct SystRec {
    name: String,
    class: SystClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LogkKind {
    Avg,
    HalfDiff,
}

#[derive(Debug)]
struct LogkRec {
    chan: usize,
    proc: usize,
    syst: usize,
    kind: LogkKind,
    /// Per-bin log-effect for the channel, already masked to the nominal
    /// yield's sparsity pattern.
    values: Vec<f64>,
}

/// Builder accumulating templates into the canonical model tensor.
pub struct ModelTensorBuilder {
    sparse: bool,
    allow_negative_expectation: bool,
    symmetric: bool,

    channels: Vec<ChannelEntry>,
    channel_lookup: HashMap<String, usize>,

    procs: Vec<ProcessRec>,
    proc_lookup: HashMap<String, usize>,
    /// Nominal yields keyed by `(channel id, process id)`.
    norm: HashMap<(usize, usize), Vec<f64>>,

    data_obs: HashMap<usize, Vec<f64>>,
    pseudodata: BTreeMap<String, HashMap<usize, Vec<f64>>>,
    data_cov_inv: Option<Vec<f64>>,

    systs: Vec<SystRec>,
    syst_lookup: HashMap<String, usize>,
    logk: Vec<LogkRec>,
    booked: HashSet<(usize, usize, usize, LogkKind)>,

    noigroups: BTreeMap<String, Vec<String>>,
    systgroups: BTreeMap<String, Vec<String>>,
}

impl Default for ModelTensorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelTensorBuilder {
    /// Create a builder producing a dense tensor.
    pub fn new() -> Self {
        Self {
            sparse: false,
            allow_negative_expectation: false,
            symmetric: true,
            channels: Vec::new(),
            channel_lookup: HashMap::new(),
            procs: Vec::new(),
            proc_lookup: HashMap::new(),
            norm: HashMap::new(),
            data_obs: HashMap::new(),
            pseudodata: BTreeMap::new(),
            data_cov_inv: None,
            systs: Vec::new(),
            syst_lookup: HashMap::new(),
            logk: Vec::new(),
            booked: HashSet::new(),
            noigroups: BTreeMap::new(),
            systgroups: BTreeMap::new(),
        }
    }

    /// Emit a sparse coordinate-list tensor instead of dense arrays.
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Keep negative nominal yields instead of clamping them to zero.
    pub fn allow_negative_expectation(mut self, allow: bool) -> Self {
        self.allow_negative_expectation = allow;
        self
    }

    /// Register a channel's binning.
    ///
    /// Re-registering with identical axes is a no-op; different axes are a
    /// configuration error.
    pub fn add_channel(&mut self, name: &str, axes: Vec<Axis>) -> Result<usize> {
        if let Some(&idx) = self.channel_lookup.get(name) {
            if self.channels[idx].axes == axes {
                return Ok(idx);
            }
            return Err(Error::Configuration(format!(
                "Channel '{name}' re-registered with different axes"
            )));
        }
        let nbins = bin_count(&axes);
        if nbins == 0 {
            return Err(Error::Configuration(format!("Channel '{name}' has no bins")));
        }
        let idx = self.channels.len();
        log::debug!("Add channel {name} with {nbins} bins");
        self.channels.push(ChannelEntry { name: name.to_string(), axes, nbins, sumw2: vec![0.0; nbins] });
        self.channel_lookup.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Resolve a histogram's channel, optionally auto-registering it.
    fn check_hist_and_channel<H: Histogram>(&mut self, h: &H, channel: &str, add: bool) -> Result<usize> {
        match self.channel_lookup.get(channel) {
            Some(&idx) => {
                if h.axes() != self.channels[idx].axes.as_slice() {
                    return Err(Error::Configuration(format!(
                        "Histogram axes differ from axes of channel '{channel}'"
                    )));
                }
                Ok(idx)
            }
            None if add => self.add_channel(channel, h.axes().to_vec()),
            None => Err(Error::Configuration(format!("Channel '{channel}' not known"))),
        }
    }

    /// Register the observed data histogram for a channel.
    pub fn add_data<H: Histogram>(&mut self, h: &H, channel: &str) -> Result<()> {
        let chan = self.check_hist_and_channel(h, channel, true)?;
        if self.data_obs.contains_key(&chan) {
            return Err(Error::Configuration(format!(
                "Data histogram for channel '{channel}' already set"
            )));
        }
        let values = h.values();
        check_finite(&values, &format!("data for channel '{channel}'"))?;
        self.data_obs.insert(chan, values);
        Ok(())
    }

    /// Register an externally provided data covariance (chi-square mode).
    ///
    /// The matrix is inverted here; use
    /// [`add_data_covariance_inverted`](Self::add_data_covariance_inverted)
    /// when the inverse is already available.
    pub fn add_data_covariance(&mut self, cov: &[f64]) -> Result<()> {
        let nbins = self.nbins();
        if cov.len() != nbins * nbins {
            return Err(Error::Configuration(format!(
                "Data covariance has {} entries, expected {}",
                cov.len(),
                nbins * nbins
            )));
        }
        check_finite(cov, "data covariance")?;
        let m = DMatrix::from_row_slice(nbins, nbins, cov);
        let inv = m.try_inverse().ok_or_else(|| {
            Error::Configuration("Data covariance matrix is not invertible".to_string())
        })?;
        self.data_cov_inv = Some(inv.transpose().as_slice().to_vec());
        Ok(())
    }

    /// Register an already-inverted data covariance (chi-square mode).
    pub fn add_data_covariance_inverted(&mut self, cov_inv: Vec<f64>) -> Result<()> {
        let nbins = self.nbins();
        if cov_inv.len() != nbins * nbins {
            return Err(Error::Configuration(format!(
                "Inverted data covariance has {} entries, expected {}",
                cov_inv.len(),
                nbins * nbins
            )));
        }
        check_finite(&cov_inv, "inverted data covariance")?;
        self.data_cov_inv = Some(cov_inv);
        Ok(())
    }

    /// Register a named pseudo-data histogram for a channel.
    pub fn add_pseudodata<H: Histogram>(&mut self, h: &H, name: &str, channel: &str) -> Result<()> {
        let chan = self.check_hist_and_channel(h, channel, true)?;
        let values = h.values();
        check_finite(&values, &format!("pseudodata '{name}' for channel '{channel}'"))?;
        let per_channel = self.pseudodata.entry(name.to_string()).or_default();
        if per_channel.contains_key(&chan) {
            return Err(Error::Configuration(format!(
                "Pseudodata histogram '{name}' for channel '{channel}' already set"
            )));
        }
        per_channel.insert(chan, values);
        Ok(())
    }

    /// Register a process's nominal yield and variance for a channel.
    pub fn add_process<H: Histogram>(
        &mut self,
        h: &H,
        name: &str,
        channel: &str,
        signal: bool,
    ) -> Result<()> {
        let chan = self.check_hist_and_channel(h, channel, true)?;

        let proc = match self.proc_lookup.get(name) {
            Some(&idx) => {
                if self.procs[idx].signal != signal {
                    return Err(Error::Configuration(format!(
                        "Process '{name}' registered as both signal and background"
                    )));
                }
                idx
            }
            None => {
                let idx = self.procs.len();
                self.procs.push(ProcessRec { name: name.to_string(), signal });
                self.proc_lookup.insert(name.to_string(), idx);
                idx
            }
        };

        if self.norm.contains_key(&(chan, proc)) {
            return Err(Error::Configuration(format!(
                "Nominal histogram for process '{name}' for channel '{channel}' already set"
            )));
        }

        let mut values = h.values();
        let variances = h.variances().unwrap_or_else(|| vec![0.0; values.len()]);

        check_finite(&values, &format!("nominal histogram for '{name}'"))
            .map_err(|_| Error::DataIntegrity(format!(
                "NaN or Inf values encountered in nominal histogram for '{name}'"
            )))?;
        check_finite(&variances, &format!("variances for '{name}'"))
            .map_err(|_| Error::DataIntegrity(format!(
                "NaN or Inf values encountered in variances for '{name}'"
            )))?;

        if !self.allow_negative_expectation {
            for v in &mut values {
                *v = v.max(0.0);
            }
        }

        for (acc, w2) in self.channels[chan].sumw2.iter_mut().zip(&variances) {
            *acc += w2;
        }
        self.norm.insert((chan, proc), values);
        Ok(())
    }

    /// Register a flat log-normal systematic without a shape histogram.
    ///
    /// `uncertainty` is the varied-to-nominal ratio, e.g. `1.02` for a 2%
    /// normalization uncertainty.
    pub fn add_lnn_systematic(
        &mut self,
        name: &str,
        process: &str,
        channel: &str,
        uncertainty: f64,
        opts: &SystematicOptions,
    ) -> Result<()> {
        let (chan, proc) = self.resolve_proc(process, channel)?;
        let norm = self.norm[&(chan, proc)].clone();
        let syst: Vec<f64> = norm.iter().map(|&v| v * uncertainty).collect();
        let logk = self.get_logk(&syst, &norm, opts.kfactor)?;
        let syst_id = self.book_systematic(name, opts)?;
        self.book_logk(logk, chan, proc, syst_id, LogkKind::Avg)?;
        Ok(())
    }

    /// Register a shape systematic from a mirrored template or an up/down pair.
    pub fn add_systematic<H: Histogram>(
        &mut self,
        variation: Variation<'_, H>,
        name: &str,
        process: &str,
        channel: &str,
        opts: &SystematicOptions,
    ) -> Result<()> {
        let (chan, proc) = self.resolve_proc(process, channel)?;
        let norm = self.norm[&(chan, proc)].clone();

        let (logkavg, logkhalfdiff) = match variation {
            Variation::Mirror(h) => {
                self.check_hist_and_channel(h, channel, false)?;
                let syst = h.values();
                (self.get_logk(&syst, &norm, opts.kfactor)?, None)
            }
            Variation::UpDown(up, down) => {
                self.check_hist_and_channel(up, channel, false)?;
                self.check_hist_and_channel(down, channel, false)?;

                let logkup = self.get_logk(&up.values(), &norm, opts.kfactor)?;
                let logkdown: Vec<f64> =
                    self.get_logk(&down.values(), &norm, opts.kfactor)?.iter().map(|v| -v).collect();

                match opts.symmetrize {
                    Symmetrization::Conservative => {
                        // largest magnitude of up and down, per bin
                        let avg = logkup
                            .iter()
                            .zip(&logkdown)
                            .map(|(&u, &d)| if u.abs() > d.abs() { u } else { d })
                            .collect();
                        (avg, None)
                    }
                    Symmetrization::Average => {
                        let avg = logkup.iter().zip(&logkdown).map(|(&u, &d)| 0.5 * (u + d)).collect();
                        (avg, None)
                    }
                    Symmetrization::Linear | Symmetrization::Quadratic => {
                        // split the asymmetric variation into two symmetric ones;
                        // the quadratic mode inflates the difference term by sqrt(3)
                        let diff_fact = if opts.symmetrize == Symmetrization::Quadratic {
                            3.0_f64.sqrt()
                        } else {
                            1.0
                        };
                        let avg: Vec<f64> =
                            logkup.iter().zip(&logkdown).map(|(&u, &d)| 0.5 * (u + d)).collect();
                        let diffavg: Vec<f64> = logkup
                            .iter()
                            .zip(&logkdown)
                            .map(|(&u, &d)| 0.5 * diff_fact * (u - d))
                            .collect();

                        let diff_name = format!("{name}SymDiff");
                        let diff_id = self.book_systematic(&diff_name, opts)?;
                        self.book_logk(diffavg, chan, proc, diff_id, LogkKind::Avg)?;
                        (avg, None)
                    }
                    Symmetrization::None => {
                        self.symmetric = false;
                        let avg: Vec<f64> =
                            logkup.iter().zip(&logkdown).map(|(&u, &d)| 0.5 * (u + d)).collect();
                        let halfdiff: Vec<f64> =
                            logkup.iter().zip(&logkdown).map(|(&u, &d)| 0.5 * (u - d)).collect();
                        (avg, Some(halfdiff))
                    }
                }
            }
        };

        let syst_id = self.book_systematic(name, opts)?;
        if let Some(halfdiff) = logkhalfdiff {
            self.book_logk(halfdiff, chan, proc, syst_id, LogkKind::HalfDiff)?;
        }
        self.book_logk(logkavg, chan, proc, syst_id, LogkKind::Avg)?;
        Ok(())
    }

    fn resolve_proc(&self, process: &str, channel: &str) -> Result<(usize, usize)> {
        let chan = *self
            .channel_lookup
            .get(channel)
            .ok_or_else(|| Error::Configuration(format!("Channel '{channel}' not known")))?;
        let proc = *self
            .proc_lookup
            .get(process)
            .ok_or_else(|| Error::Configuration(format!("Process '{process}' not known")))?;
        if !self.norm.contains_key(&(chan, proc)) {
            return Err(Error::Configuration(format!(
                "Process '{process}' has no nominal histogram in channel '{channel}'"
            )));
        }
        Ok((chan, proc))
    }

    /// Per-bin log-ratio of varied to nominal yields.
    ///
    /// Bins where nominal and varied yields have opposite sign get the fixed
    /// numerical floor [`LOGK_EPSILON`] instead of an undefined logarithm.
    fn get_logk(&self, syst: &[f64], norm: &[f64], kfactor: f64) -> Result<Vec<f64>> {
        let n_bad = syst.iter().filter(|v| !v.is_finite()).count();
        if n_bad > 0 {
            return Err(Error::DataIntegrity(format!(
                "{n_bad} NaN or Inf values encountered in systematic"
            )));
        }
        Ok(syst
            .iter()
            .zip(norm)
            .map(|(&s, &n)| {
                if (n * s).signum() == 1.0 {
                    kfactor * (s / n).ln()
                } else {
                    LOGK_EPSILON
                }
            })
            .collect())
    }

    fn book_logk(
        &mut self,
        mut values: Vec<f64>,
        chan: usize,
        proc: usize,
        syst: usize,
        kind: LogkKind,
    ) -> Result<()> {
        if !self.booked.insert((chan, proc, syst, kind)) {
            return Err(Error::Configuration(format!(
                "Systematic '{}' already booked for process '{}' in channel '{}'",
                self.systs[syst].name, self.procs[proc].name, self.channels[chan].name
            )));
        }
        // the effect tensor must be sparse wherever the nominal yields are
        let norm = &self.norm[&(chan, proc)];
        for (v, &n) in values.iter_mut().zip(norm) {
            if n == 0.0 {
                *v = 0.0;
            }
        }
        self.logk.push(LogkRec { chan, proc, syst, kind, values });
        Ok(())
    }

    fn book_systematic(&mut self, name: &str, opts: &SystematicOptions) -> Result<usize> {
        let class = if !opts.profile {
            SystClass::NoProfile
        } else if opts.noi {
            SystClass::Noi
        } else if !opts.constrained {
            SystClass::NoConstraint
        } else {
            SystClass::Standard
        };

        let idx = match self.syst_lookup.get(name) {
            Some(&idx) => {
                if self.systs[idx].class != class {
                    return Err(Error::Configuration(format!(
                        "Systematic '{name}' re-registered with a different classification"
                    )));
                }
                idx
            }
            None => {
                log::debug!("Book systematic {name}");
                let idx = self.systs.len();
                self.systs.push(SystRec { name: name.to_string(), class });
                self.syst_lookup.insert(name.to_string(), idx);
                idx
            }
        };

        let groups = opts.groups.clone().unwrap_or_else(|| vec![name.to_string()]);
        let target = if opts.noi { &mut self.noigroups } else { &mut self.systgroups };
        for group in groups {
            let members = target.entry(group).or_default();
            if !members.iter().any(|m| m == name) {
                members.push(name.to_string());
            }
        }

        Ok(idx)
    }

    /// Total bin count registered so far.
    pub fn nbins(&self) -> usize {
        self.channels.iter().map(|c| c.nbins).sum()
    }

    /// Finalize into the canonical, immutable model tensor.
    pub fn finalize(self) -> Result<ModelTensor> {
        let nbins = self.nbins();
        if nbins == 0 {
            return Err(Error::Configuration("No channels registered".to_string()));
        }

        // Canonical process order: signals sorted by name, then backgrounds.
        let mut signal_ids: Vec<usize> =
            (0..self.procs.len()).filter(|&i| self.procs[i].signal).collect();
        let mut bkg_ids: Vec<usize> =
            (0..self.procs.len()).filter(|&i| !self.procs[i].signal).collect();
        signal_ids.sort_by(|&a, &b| self.procs[a].name.cmp(&self.procs[b].name));
        bkg_ids.sort_by(|&a, &b| self.procs[a].name.cmp(&self.procs[b].name));
        let nsignals = signal_ids.len();
        let proc_order: Vec<usize> = signal_ids.into_iter().chain(bkg_ids).collect();
        let mut proc_canon = vec![0usize; self.procs.len()];
        for (canon, &old) in proc_order.iter().enumerate() {
            proc_canon[old] = canon;
        }
        let procs: Vec<String> = proc_order.iter().map(|&i| self.procs[i].name.clone()).collect();
        let nproc = procs.len();

        // Canonical systematic order: noi, no-constraint, standard, no-profile,
        // sorted by name within each block.
        let mut syst_order: Vec<usize> = (0..self.systs.len()).collect();
        syst_order.sort_by(|&a, &b| {
            self.systs[a]
                .class
                .cmp(&self.systs[b].class)
                .then_with(|| self.systs[a].name.cmp(&self.systs[b].name))
        });
        let mut syst_canon = vec![0usize; self.systs.len()];
        for (canon, &old) in syst_order.iter().enumerate() {
            syst_canon[old] = canon;
        }
        let systs: Vec<String> = syst_order.iter().map(|&i| self.systs[i].name.clone()).collect();
        let nsyst = systs.len();

        let names_of = |class: SystClass| -> Vec<String> {
            syst_order
                .iter()
                .filter(|&&i| self.systs[i].class == class)
                .map(|&i| self.systs[i].name.clone())
                .collect()
        };
        let systsnoi = names_of(SystClass::Noi);
        let mut systsnoconstraint = systsnoi.clone();
        systsnoconstraint.extend(names_of(SystClass::NoConstraint));
        let systsnoprofile = names_of(SystClass::NoProfile);

        let constraintweights: Vec<f64> = syst_order
            .iter()
            .map(|&i| match self.systs[i].class {
                SystClass::Noi | SystClass::NoConstraint => 0.0,
                SystClass::Standard | SystClass::NoProfile => 1.0,
            })
            .collect();

        let resolve_groups = |dict: &BTreeMap<String, Vec<String>>| -> Result<Vec<SystGroup>> {
            dict.iter()
                .map(|(group, members)| {
                    let mut indices = Vec::with_capacity(members.len());
                    for m in members {
                        let old = *self.syst_lookup.get(m).ok_or_else(|| {
                            Error::Configuration(format!("Group '{group}' references unknown systematic '{m}'"))
                        })?;
                        indices.push(syst_canon[old]);
                    }
                    indices.sort_unstable();
                    Ok(SystGroup { name: group.clone(), indices })
                })
                .collect()
        };
        let systgroups = resolve_groups(&self.systgroups)?;
        let noigroups = resolve_groups(&self.noigroups)?;

        // Channel metadata with global bin offsets (registration order).
        let mut channels = Vec::with_capacity(self.channels.len());
        let mut offset = 0usize;
        for c in &self.channels {
            channels.push(ChannelInfo { name: c.name.clone(), axes: c.axes.clone(), bin_offset: offset });
            offset += c.nbins;
        }

        // Observed data: all channels or none.
        let data_obs = if self.data_obs.is_empty() {
            None
        } else {
            let mut flat = vec![0.0; nbins];
            for (chan_idx, c) in channels.iter().enumerate() {
                let values = self.data_obs.get(&chan_idx).ok_or_else(|| {
                    Error::Configuration(format!("Missing data histogram for channel '{}'", c.name))
                })?;
                flat[c.bin_offset..c.bin_offset + values.len()].copy_from_slice(values);
            }
            Some(flat)
        };

        // Pseudo-data matrix: each named set must cover every channel.
        let pseudodata_names: Vec<String> = self.pseudodata.keys().cloned().collect();
        let npd = pseudodata_names.len();
        let mut pseudodata = vec![0.0; nbins * npd];
        for (ipd, name) in pseudodata_names.iter().enumerate() {
            let per_channel = &self.pseudodata[name];
            for (chan_idx, c) in channels.iter().enumerate() {
                let values = per_channel.get(&chan_idx).ok_or_else(|| {
                    Error::Configuration(format!(
                        "Missing pseudodata '{name}' for channel '{}'",
                        c.name
                    ))
                })?;
                for (i, &v) in values.iter().enumerate() {
                    pseudodata[(c.bin_offset + i) * npd + ipd] = v;
                }
            }
        }

        // Barlow-Beeston shape parameter per bin: k = (sum w)^2 / sum w^2,
        // clamped to 1 when either side degenerates.
        let mut sumw = vec![0.0; nbins];
        let mut sumw2 = vec![0.0; nbins];
        for (chan_idx, c) in channels.iter().enumerate() {
            for (i, &w2) in self.channels[chan_idx].sumw2.iter().enumerate() {
                sumw2[c.bin_offset + i] = w2;
            }
            for old_proc in 0..self.procs.len() {
                if let Some(values) = self.norm.get(&(chan_idx, old_proc)) {
                    for (i, &v) in values.iter().enumerate() {
                        sumw[c.bin_offset + i] += v;
                    }
                }
            }
        }
        let kstat: Vec<f64> = sumw
            .iter()
            .zip(&sumw2)
            .map(|(&w, &w2)| if w == 0.0 || w2 == 0.0 { 1.0 } else { w * w / w2 })
            .collect();

        let symmetric = self.symmetric;
        let nslots = if symmetric { nsyst } else { 2 * nsyst };

        let (norm, logk) = if self.sparse {
            self.assemble_sparse(&channels, &proc_canon, &syst_canon, nbins, nproc, nsyst, nslots)?
        } else {
            self.assemble_dense(&channels, &proc_canon, &syst_canon, nbins, nproc, nsyst, symmetric)?
        };

        Ok(ModelTensor {
            channels,
            nbins,
            procs,
            nsignals,
            systs,
            systsnoi,
            systsnoconstraint,
            systsnoprofile,
            constraintweights,
            systgroups,
            noigroups,
            kstat,
            data_obs,
            pseudodata_names,
            pseudodata,
            data_cov_inv: self.data_cov_inv,
            symmetric,
            norm,
            logk,
        })
    }

    fn assemble_dense(
        &self,
        channels: &[ChannelInfo],
        proc_canon: &[usize],
        syst_canon: &[usize],
        nbins: usize,
        nproc: usize,
        nsyst: usize,
        symmetric: bool,
    ) -> Result<(NormStorage, LogkStorage)> {
        let mut norm = vec![0.0; nbins * nproc];
        let nslices = if symmetric { 1 } else { 2 };
        let mut logk = vec![0.0; nbins * nproc * nslices * nsyst];

        for (chan_idx, c) in channels.iter().enumerate() {
            for old_proc in 0..self.procs.len() {
                if let Some(values) = self.norm.get(&(chan_idx, old_proc)) {
                    let iproc = proc_canon[old_proc];
                    for (i, &v) in values.iter().enumerate() {
                        norm[(c.bin_offset + i) * nproc + iproc] = v;
                    }
                }
            }
        }

        for rec in &self.logk {
            let c = &channels[rec.chan];
            let iproc = proc_canon[rec.proc];
            let isyst = syst_canon[rec.syst];
            let half = match rec.kind {
                LogkKind::Avg => 0,
                LogkKind::HalfDiff => 1,
            };
            for (i, &v) in rec.values.iter().enumerate() {
                let bin = c.bin_offset + i;
                let idx = if symmetric {
                    (bin * nproc + iproc) * nsyst + isyst
                } else {
                    ((bin * nproc + iproc) * 2 + half) * nsyst + isyst
                };
                logk[idx] = v;
            }
        }

        Ok((NormStorage::Dense(norm), LogkStorage::Dense(logk)))
    }

    fn assemble_sparse(
        &self,
        channels: &[ChannelInfo],
        proc_canon: &[usize],
        syst_canon: &[usize],
        nbins: usize,
        nproc: usize,
        nsyst: usize,
        nslots: usize,
    ) -> Result<(NormStorage, LogkStorage)> {
        // Append norm entries; remember the entry position of each nonzero
        // (channel, process, local bin) so effect entries can point at it.
        let mut norm_indices: Vec<[i64; 2]> = Vec::new();
        let mut norm_values: Vec<f64> = Vec::new();
        let mut entry_of: HashMap<(usize, usize), Vec<i64>> = HashMap::new();

        for (chan_idx, c) in channels.iter().enumerate() {
            for old_proc in 0..self.procs.len() {
                if let Some(values) = self.norm.get(&(chan_idx, old_proc)) {
                    let iproc = proc_canon[old_proc];
                    let mut positions = vec![-1i64; values.len()];
                    for (i, &v) in values.iter().enumerate() {
                        if v != 0.0 {
                            positions[i] = norm_values.len() as i64;
                            norm_indices.push([(c.bin_offset + i) as i64, iproc as i64]);
                            norm_values.push(v);
                        }
                    }
                    entry_of.insert((chan_idx, old_proc), positions);
                }
            }
        }

        let (norm_sparse, perm) =
            SparseArray2::from_entries(norm_indices, norm_values, [nbins, nproc]);

        // Effect entries reference the sorted norm entry positions.
        let mut logk_indices: Vec<[i64; 2]> = Vec::new();
        let mut logk_values: Vec<f64> = Vec::new();
        for rec in &self.logk {
            let positions = entry_of.get(&(rec.chan, rec.proc)).ok_or_else(|| {
                Error::Configuration(format!(
                    "Effect booked for process '{}' without nominal yields in channel '{}'",
                    self.procs[rec.proc].name, self.channels[rec.chan].name
                ))
            })?;
            let isyst = syst_canon[rec.syst];
            let slot = match rec.kind {
                LogkKind::Avg => isyst,
                LogkKind::HalfDiff => nsyst + isyst,
            };
            for (i, &v) in rec.values.iter().enumerate() {
                if v != 0.0 {
                    // masked values guarantee positions[i] >= 0 here
                    let entry = perm[positions[i] as usize] as i64;
                    logk_indices.push([entry, slot as i64]);
                    logk_values.push(v);
                }
            }
        }

        let nnz = norm_sparse.nnz();
        let (logk_sparse, _) = SparseArray2::from_entries(logk_indices, logk_values, [nnz, nslots]);

        Ok((NormStorage::Sparse(norm_sparse), LogkStorage::Sparse(logk_sparse)))
    }
}

fn check_finite(values: &[f64], what: &str) -> Result<()> {
    let n_bad = values.iter().filter(|v| !v.is_finite()).count();
    if n_bad > 0 {
        return Err(Error::DataIntegrity(format!(
            "{n_bad} NaN or Inf values encountered in {what}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axes() -> Vec<Axis> {
        vec![Axis::regular("x", 3, 0.0, 3.0)]
    }

    fn hist(values: Vec<f64>) -> ArrayHistogram {
        ArrayHistogram::new(axes(), values).unwrap()
    }

    fn hist_var(values: Vec<f64>, variances: Vec<f64>) -> ArrayHistogram {
        ArrayHistogram::new(axes(), values).unwrap().with_variances(variances).unwrap()
    }

    fn base_builder() -> ModelTensorBuilder {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(&hist_var(vec![10.0, 5.0, 2.0], vec![1.0, 0.5, 0.2]), "sig", "ch0", true)
            .unwrap();
        b.add_data(&hist(vec![11.0, 5.0, 2.0]), "ch0").unwrap();
        b
    }

    #[test]
    fn test_average_symmetrization() {
        let mut b = base_builder();
        let up = hist(vec![11.0, 5.5, 2.2]);
        let down = hist(vec![9.0, 4.5, 1.8]);
        b.add_systematic(
            Variation::UpDown(&up, &down),
            "scale",
            "sig",
            "ch0",
            &SystematicOptions::default(),
        )
        .unwrap();
        let t = b.finalize().unwrap();

        assert!(t.symmetric);
        for bin in 0..3 {
            let nom = t.norm_at(bin, 0);
            let up_logk = (up.values()[bin] / nom).ln();
            let down_logk = -(down.values()[bin] / nom).ln();
            assert_relative_eq!(
                t.logk_at(bin, 0, 0, 0),
                0.5 * (up_logk + down_logk),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_conservative_picks_larger_magnitude() {
        let mut b = base_builder();
        // up is a +20% shift, down only -5%: conservative keeps the +20% logk
        let up = hist(vec![12.0, 6.0, 2.4]);
        let down = hist(vec![9.5, 4.75, 1.9]);
        let opts = SystematicOptions { symmetrize: Symmetrization::Conservative, ..Default::default() };
        b.add_systematic(Variation::UpDown(&up, &down), "scale", "sig", "ch0", &opts).unwrap();
        let t = b.finalize().unwrap();
        assert_relative_eq!(t.logk_at(0, 0, 0, 0), (12.0_f64 / 10.0).ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_linear_quadratic_register_derived_systematic() {
        for (mode, fact) in [(Symmetrization::Linear, 1.0), (Symmetrization::Quadratic, 3.0_f64.sqrt())] {
            let mut b = base_builder();
            let up = hist(vec![12.0, 6.0, 2.4]);
            let down = hist(vec![9.5, 4.75, 1.9]);
            let opts = SystematicOptions { symmetrize: mode, ..Default::default() };
            b.add_systematic(Variation::UpDown(&up, &down), "scale", "sig", "ch0", &opts).unwrap();
            let t = b.finalize().unwrap();

            assert!(t.symmetric);
            assert_eq!(t.systs, vec!["scale".to_string(), "scaleSymDiff".to_string()]);

            let up_logk = (12.0_f64 / 10.0).ln();
            let down_logk = -(9.5_f64 / 10.0).ln();
            let iavg = t.parameter_index("scale").unwrap() - t.npoi();
            let idiff = t.parameter_index("scaleSymDiff").unwrap() - t.npoi();
            assert_relative_eq!(t.logk_at(0, 0, 0, iavg), 0.5 * (up_logk + down_logk), epsilon = 1e-12);
            assert_relative_eq!(
                t.logk_at(0, 0, 0, idiff),
                0.5 * fact * (up_logk - down_logk),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_no_symmetrization_stores_halfdiff_and_marks_asymmetric() {
        let mut b = base_builder();
        let up = hist(vec![12.0, 6.0, 2.4]);
        let down = hist(vec![9.5, 4.75, 1.9]);
        let opts = SystematicOptions { symmetrize: Symmetrization::None, ..Default::default() };
        b.add_systematic(Variation::UpDown(&up, &down), "scale", "sig", "ch0", &opts).unwrap();
        let t = b.finalize().unwrap();

        assert!(!t.symmetric);
        let up_logk = (12.0_f64 / 10.0).ln();
        let down_logk = -(9.5_f64 / 10.0).ln();
        assert_relative_eq!(t.logk_at(0, 0, 0, 0), 0.5 * (up_logk + down_logk), epsilon = 1e-12);
        assert_relative_eq!(t.logk_at(0, 0, 1, 0), 0.5 * (up_logk - down_logk), epsilon = 1e-12);
    }

    #[test]
    fn test_sign_flip_floor() {
        let mut b = ModelTensorBuilder::new().allow_negative_expectation(true);
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(&hist(vec![10.0, 5.0, 2.0]), "sig", "ch0", true).unwrap();
        // middle bin flips sign relative to nominal
        let varied = hist(vec![11.0, -0.5, 2.2]);
        b.add_systematic(
            Variation::Mirror(&varied),
            "flip",
            "sig",
            "ch0",
            &SystematicOptions::default(),
        )
        .unwrap();
        let t = b.finalize().unwrap();
        assert_relative_eq!(t.logk_at(1, 0, 0, 0), LOGK_EPSILON, epsilon = 1e-12);
        assert!(t.logk_at(0, 0, 0, 0).is_finite());
    }

    #[test]
    fn test_sparsity_invariant() {
        for sparse in [false, true] {
            let mut b = ModelTensorBuilder::new().sparse(sparse);
            b.add_channel("ch0", axes()).unwrap();
            // middle bin has exactly zero nominal yield
            b.add_process(&hist(vec![10.0, 0.0, 2.0]), "sig", "ch0", true).unwrap();
            let varied = hist(vec![11.0, 1.0, 2.2]);
            b.add_systematic(
                Variation::Mirror(&varied),
                "shape",
                "sig",
                "ch0",
                &SystematicOptions::default(),
            )
            .unwrap();
            let t = b.finalize().unwrap();
            assert_eq!(t.norm_at(1, 0), 0.0);
            assert_eq!(t.logk_at(1, 0, 0, 0), 0.0, "sparse={sparse}");
        }
    }

    #[test]
    fn test_canonical_ordering() {
        let mut b = base_builder();
        let v = hist(vec![11.0, 5.5, 2.2]);
        let mk = |noi, constrained, profile| SystematicOptions {
            noi,
            constrained,
            profile,
            ..Default::default()
        };
        // registration order deliberately scrambled
        b.add_systematic(Variation::Mirror(&v), "zz_std", "sig", "ch0", &mk(false, true, true)).unwrap();
        b.add_systematic(Variation::Mirror(&v), "aa_fixed", "sig", "ch0", &mk(false, true, false)).unwrap();
        b.add_systematic(Variation::Mirror(&v), "mm_free", "sig", "ch0", &mk(false, false, true)).unwrap();
        b.add_systematic(Variation::Mirror(&v), "bb_noi", "sig", "ch0", &mk(true, true, true)).unwrap();
        b.add_systematic(Variation::Mirror(&v), "aa_std", "sig", "ch0", &mk(false, true, true)).unwrap();
        let t = b.finalize().unwrap();

        assert_eq!(t.systs, vec!["bb_noi", "mm_free", "aa_std", "zz_std", "aa_fixed"]);
        assert_eq!(t.systsnoconstraint, vec!["bb_noi", "mm_free"]);
        assert_eq!(t.systsnoprofile, vec!["aa_fixed"]);
        assert_eq!(t.constraintweights, vec![0.0, 0.0, 1.0, 1.0, 1.0]);
        assert_eq!(t.nsyst_profiled(), 4);
        assert!(t.is_constrained(2));
        assert!(!t.is_constrained(0));
        assert!(!t.is_constrained(4));
    }

    #[test]
    fn test_kstat() {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(&hist_var(vec![8.0, 0.0, 2.0], vec![4.0, 0.0, 0.0]), "sig", "ch0", true)
            .unwrap();
        let t = b.finalize().unwrap();
        // bin 0: (8)^2 / 4 = 16; bin 1: sumw = 0 -> 1; bin 2: sumw2 = 0 -> 1
        assert_relative_eq!(t.kstat[0], 16.0, epsilon = 1e-12);
        assert_relative_eq!(t.kstat[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(t.kstat[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_signal_background_overlap_rejected() {
        let mut b = base_builder();
        let err = b
            .add_process(&hist(vec![1.0, 1.0, 1.0]), "sig", "ch0", false)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_duplicate_registrations_rejected() {
        let mut b = base_builder();
        assert!(matches!(
            b.add_data(&hist(vec![1.0, 1.0, 1.0]), "ch0"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            b.add_process(&hist(vec![1.0, 1.0, 1.0]), "sig", "ch0", true),
            Err(Error::Configuration(_))
        ));
        b.add_pseudodata(&hist(vec![1.0, 1.0, 1.0]), "alt", "ch0").unwrap();
        assert!(matches!(
            b.add_pseudodata(&hist(vec![1.0, 1.0, 1.0]), "alt", "ch0"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_non_finite_inputs_rejected() {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        assert!(matches!(
            b.add_process(&hist(vec![1.0, f64::NAN, 1.0]), "sig", "ch0", true),
            Err(Error::DataIntegrity(_))
        ));
        b.add_process(&hist(vec![1.0, 2.0, 1.0]), "sig", "ch0", true).unwrap();
        assert!(matches!(
            b.add_systematic(
                Variation::Mirror(&hist(vec![1.0, f64::INFINITY, 1.0])),
                "bad",
                "sig",
                "ch0",
                &SystematicOptions::default()
            ),
            Err(Error::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_axis_mismatch_rejected() {
        let mut b = base_builder();
        let other = ArrayHistogram::new(vec![Axis::regular("x", 4, 0.0, 4.0)], vec![1.0; 4]).unwrap();
        assert!(matches!(
            b.add_systematic(
                Variation::Mirror(&other),
                "bad",
                "sig",
                "ch0",
                &SystematicOptions::default()
            ),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            b.add_channel("ch0", vec![Axis::regular("x", 4, 0.0, 4.0)]),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_lnn_systematic() {
        let mut b = base_builder();
        b.add_lnn_systematic("lumi", "sig", "ch0", 1.025, &SystematicOptions::default()).unwrap();
        let t = b.finalize().unwrap();
        for bin in 0..3 {
            assert_relative_eq!(t.logk_at(bin, 0, 0, 0), 1.025_f64.ln(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_negative_yields_clamped_by_default() {
        let mut b = ModelTensorBuilder::new();
        b.add_channel("ch0", axes()).unwrap();
        b.add_process(&hist(vec![1.0, -2.0, 3.0]), "bkg", "ch0", false).unwrap();
        let t = b.finalize().unwrap();
        assert_eq!(t.norm_at(1, 0), 0.0);
    }

    #[test]
    fn test_sparse_matches_dense() {
        let build = |sparse: bool| {
            let mut b = ModelTensorBuilder::new().sparse(sparse);
            b.add_channel("ch0", axes()).unwrap();
            b.add_process(&hist_var(vec![10.0, 0.0, 2.0], vec![1.0, 0.0, 0.2]), "sig", "ch0", true)
                .unwrap();
            b.add_process(&hist(vec![3.0, 4.0, 0.0]), "bkg", "ch0", false).unwrap();
            let up = hist(vec![12.0, 0.0, 2.4]);
            let down = hist(vec![9.0, 0.0, 1.9]);
            let opts =
                SystematicOptions { symmetrize: Symmetrization::None, ..Default::default() };
            b.add_systematic(Variation::UpDown(&up, &down), "shape", "sig", "ch0", &opts).unwrap();
            b.add_lnn_systematic("norm_bkg", "bkg", "ch0", 1.05, &SystematicOptions::default())
                .unwrap();
            b.finalize().unwrap()
        };
        let dense = build(false);
        let sparse = build(true);

        assert_eq!(dense.systs, sparse.systs);
        assert_eq!(dense.symmetric, sparse.symmetric);
        for bin in 0..3 {
            for proc in 0..2 {
                assert_relative_eq!(
                    dense.norm_at(bin, proc),
                    sparse.norm_at(bin, proc),
                    epsilon = 1e-12
                );
                for half in 0..2 {
                    for isyst in 0..2 {
                        assert_relative_eq!(
                            dense.logk_at(bin, proc, half, isyst),
                            sparse.logk_at(bin, proc, half, isyst),
                            epsilon = 1e-12
                        );
                    }
                }
            }
        }

        if let (NormStorage::Sparse(n), LogkStorage::Sparse(k)) = (&sparse.norm, &sparse.logk) {
            assert!(n.is_canonical());
            assert!(k.is_canonical());
        } else {
            panic!("sparse build did not produce sparse storage");
        }
    }
}
