//! Command-line driver for binned template fits.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use binfit_inference::{
    contour_scan, contour_scan2d, global_impacts, impacts, nll_scan, nll_scan2d,
    prefit_covariance, FitConfig, Fitter, ResultWriter, ToyGenerator,
};
use binfit_tensor::{read_model, ModelTensor};

#[derive(Parser)]
#[command(name = "binfit-fit")]
#[command(about = "Binned maximum-likelihood template fits")]
#[command(version)]
struct Cli {
    /// Input model tensor container
    input: PathBuf,

    /// Output results container. Defaults to `fitresults.bft` next to the input.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of toys: -1 fits the Asimov dataset, 0 fits the data, N runs N toys
    #[arg(short = 't', long, default_value = "-1")]
    toys: i64,

    /// Sample constrained nuisance parameters from their priors per toy
    #[arg(long)]
    toys_bayesian: bool,

    /// Sample toy counts around the observed data instead of the expectation
    #[arg(long)]
    bootstrap_data: bool,

    /// Base random seed; toy i uses seed + i
    #[arg(long, default_value = "123456789")]
    seed: u64,

    /// Nominal signal strength for default assignment and toy generation
    #[arg(long, default_value = "1.0")]
    expect_signal: f64,

    /// Allow signal strengths to go negative
    #[arg(long)]
    allow_negative_poi: bool,

    /// Fit a named pseudo-data set instead of the observed data
    #[arg(long)]
    pseudo_data: Option<String>,

    /// Chi-square fit instead of the Poisson likelihood
    #[arg(long)]
    chisq_fit: bool,

    /// Use the full external data covariance in the chi-square fit
    #[arg(long, requires = "chisq_fit")]
    external_covariance: bool,

    /// Profile Barlow-Beeston-lite per-bin statistical nuisances
    #[arg(long)]
    bin_by_bin_stat: bool,

    /// Parameters to scan (1D profile likelihood)
    #[arg(long, num_args = 1..)]
    scan: Vec<String>,

    /// Parameter pairs to scan on a 2D grid (name1 name2 [name3 name4 ...])
    #[arg(long, num_args = 2..)]
    scan2d: Vec<String>,

    /// Number of scan points per axis
    #[arg(long, default_value = "21")]
    scan_points: usize,

    /// Scan half-range in units of the parameter uncertainty
    #[arg(long, default_value = "3.0")]
    scan_range: f64,

    /// Use prefit instead of postfit uncertainties for scan ranges
    #[arg(long)]
    scan_range_use_prefit: bool,

    /// Parameters to run the contour search on
    #[arg(long, num_args = 1..)]
    contour_scan: Vec<String>,

    /// Confidence levels for the contour search, in standard deviations
    #[arg(long, num_args = 1.., default_values_t = vec![1.0])]
    contour_levels: Vec<f64>,

    /// Parameter pairs for 2D contour tracing (not implemented; reports an error)
    #[arg(long, num_args = 2..)]
    contour_scan2d: Vec<String>,

    /// Compute per-nuisance and grouped impacts for every POI
    #[arg(long)]
    do_impacts: bool,

    /// Compute global-observable impacts for every POI
    #[arg(long)]
    global_impacts: bool,

    /// Prior width assigned to unconstrained parameters in the prefit covariance
    #[arg(long, default_value = "1.0")]
    unconstrained_err: f64,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,
}

fn param_index(tensor: &ModelTensor, name: &str) -> Result<usize> {
    tensor
        .parameter_index(name)
        .with_context(|| format!("Unknown fit parameter '{name}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    let tensor = read_model(&cli.input)
        .with_context(|| format!("Failed to read model tensor from {}", cli.input.display()))?;
    tracing::info!(
        "Loaded model: {} bins, {} processes, {} systematics",
        tensor.nbins,
        tensor.nproc(),
        tensor.nsyst()
    );

    let config = FitConfig {
        ntoys: cli.toys,
        seed: cli.seed,
        expect_signal: cli.expect_signal,
        allow_negative_poi: cli.allow_negative_poi,
        toys_bayesian: cli.toys_bayesian,
        bootstrap_data: cli.bootstrap_data,
        binbybinstat: cli.bin_by_bin_stat,
        chisq: cli.chisq_fit,
        external_covariance: cli.external_covariance,
        pseudodata: cli.pseudo_data.clone(),
        unconstrained_err: cli.unconstrained_err,
    };
    let fitter = Fitter::new(&tensor, config)?;

    let outcomes = fitter.run();
    let n_failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    tracing::info!("Campaign finished: {} fits, {} failed", outcomes.len(), n_failed);

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_file_name("fitresults.bft"));
    let mut writer = ResultWriter::create(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    writer.write_meta(&serde_json::json!({
        "input": cli.input.display().to_string(),
        "toys": cli.toys,
        "toys_bayesian": cli.toys_bayesian,
        "bootstrap_data": cli.bootstrap_data,
        "seed": cli.seed,
        "expect_signal": cli.expect_signal,
        "allow_negative_poi": cli.allow_negative_poi,
        "pseudo_data": cli.pseudo_data,
        "chisq_fit": cli.chisq_fit,
        "external_covariance": cli.external_covariance,
        "bin_by_bin_stat": cli.bin_by_bin_stat,
    }))?;
    writer.write_parameter_names(&tensor.parameter_names())?;
    writer.write_outcomes(&outcomes)?;

    // downstream products are derived from the central (non-toy) fit
    let central = outcomes
        .iter()
        .find(|o| o.label == "results" || o.label == "results_asimov")
        .and_then(|o| o.result.as_ref().ok().map(|fit| (o.label.clone(), fit)));

    let wants_products = !cli.scan.is_empty()
        || !cli.scan2d.is_empty()
        || !cli.contour_scan.is_empty()
        || !cli.contour_scan2d.is_empty()
        || cli.do_impacts
        || cli.global_impacts;

    if wants_products {
        let (label, fit) = match central {
            Some(pair) => pair,
            None => {
                writer.finish()?;
                bail!("Scans, contours and impacts require a successful central fit");
            }
        };

        let data = match label.as_str() {
            "results_asimov" => {
                let generator =
                    ToyGenerator::new(&tensor, fitter.config().seed, fitter.config().expect_signal);
                fitter.expected_yield(&generator.defaultassign())?
            }
            _ => tensor
                .observation(fitter.config().pseudodata.as_deref())
                .context("The tensor carries no observed data")?,
        };
        let surface = fitter.surface(data)?;
        let bounds = fitter.bounds();

        let sigma_of = |idx: usize| -> f64 {
            if cli.scan_range_use_prefit {
                let n = tensor.nparams();
                let prefit = prefit_covariance(&tensor, cli.unconstrained_err);
                prefit[idx * n + idx].sqrt()
            } else {
                fit.uncertainties[idx]
            }
        };

        for name in &cli.scan {
            let idx = param_index(&tensor, name)?;
            tracing::info!("Scanning {name}");
            let scan = nll_scan(
                &surface,
                fitter.optimizer(),
                &bounds,
                &fit.parameters,
                fit.nll,
                idx,
                sigma_of(idx),
                cli.scan_points,
                cli.scan_range,
            )?;
            writer.write_scan(&label, name, &scan)?;
        }

        for pair in cli.scan2d.chunks(2) {
            let [x, y] = pair else {
                bail!("--scan2d takes parameter name pairs");
            };
            let (ix, iy) = (param_index(&tensor, x)?, param_index(&tensor, y)?);
            tracing::info!("Scanning {x} x {y}");
            let scan = nll_scan2d(
                &surface,
                fitter.optimizer(),
                &bounds,
                &fit.parameters,
                fit.nll,
                (ix, iy),
                (sigma_of(ix), sigma_of(iy)),
                cli.scan_points,
                cli.scan_range,
            )?;
            writer.write_scan2d(&label, (x, y), &scan)?;
        }

        for name in &cli.contour_scan {
            let idx = param_index(&tensor, name)?;
            for &level in &cli.contour_levels {
                tracing::info!("Contour search for {name} at {level} sigma");
                let contour = contour_scan(
                    &surface,
                    fitter.optimizer(),
                    &bounds,
                    &fit.parameters,
                    fit.nll,
                    idx,
                    sigma_of(idx),
                    level,
                )?;
                writer.write_contour(&label, name, level, &contour)?;
            }
        }

        if let Some(pair) = cli.contour_scan2d.chunks(2).next() {
            let [x, y] = pair else {
                bail!("--contour-scan2d takes parameter name pairs");
            };
            let (ix, iy) = (param_index(&tensor, x)?, param_index(&tensor, y)?);
            // surfaces the explicit unsupported error
            contour_scan2d(
                &surface,
                fitter.optimizer(),
                &bounds,
                &fit.parameters,
                (ix, iy),
                cli.contour_levels[0],
            )?;
        }

        if cli.do_impacts || cli.global_impacts {
            let cov = fit
                .covariance
                .as_ref()
                .context("Impacts require a postfit covariance")?;
            for poi in 0..tensor.npoi() {
                if cli.do_impacts {
                    let result = impacts(&tensor, cov, poi)?;
                    tracing::info!("Impacts for {}: total {:.4}", result.poi, result.total);
                    writer.write_impacts(&label, &result)?;
                }
                if cli.global_impacts {
                    let result = global_impacts(&tensor, cov, poi)?;
                    let poi_name = &tensor.parameter_names()[poi];
                    writer.write_global_impacts(&label, poi_name, &result)?;
                }
            }
        }
    }

    writer.finish()?;
    tracing::info!("Results written to {}", output.display());

    for outcome in &outcomes {
        if let Ok(fit) = &outcome.result {
            tracing::info!(
                "{}: nll = {:.4}, 2*(nll - saturated) = {:.4} (ndf {})",
                outcome.label,
                fit.nll,
                2.0 * (fit.nll - fit.nll_saturated),
                fit.ndf
            );
        }
    }

    Ok(())
}
