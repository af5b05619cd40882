//! Inference driver.
//!
//! Wires a fitted `LogPSplines` model and its periodogram into a
//! gradient-based sampler through `PosteriorSampler`, which receives the
//! log-posterior target with analytical gradients and the starting point,
//! and returns the draws. `NutsSampler` is the mini-mcmc implementation.
//! Randomness is owned by the sampler and seeded from `McmcConfig`.

use crate::likelihood::{HyperPriors, LogPosterior, PosteriorError};
use crate::model::{FitConfig, LogPSplines, ModelError};
use crate::spectrum::Periodogram;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum McmcError {
    #[error("Model construction failed: {0}")]
    Model(#[from] ModelError),

    #[error("Posterior construction failed: {0}")]
    Posterior(#[from] PosteriorError),

    #[error("Sampler failed: {0}")]
    SamplerFailed(String),

    #[error("Sampler returned draws of dimension {found}, expected {expected}.")]
    DrawShapeMismatch { found: usize, expected: usize },

    #[error("Cannot summarize an empty set of posterior draws.")]
    NoDraws,
}

/// Configuration for a sampling run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcConfig {
    pub priors: HyperPriors,
    /// Number of draws kept after warmup
    pub num_samples: usize,
    /// Number of warmup draws discarded
    pub num_warmup: usize,
    /// Seed handed to the sampler's random number generator
    pub rng_seed: u64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            priors: HyperPriors::default(),
            num_samples: 1000,
            num_warmup: 500,
            rng_seed: 0,
        }
    }
}

/// A gradient-based posterior sampler such as NUTS.
///
/// Implementations return draws of `theta` as the rows of a
/// `[n_draws, target.dim()]` matrix, `config.num_samples` per chain.
pub trait PosteriorSampler {
    fn sample(
        &mut self,
        target: &LogPosterior,
        init: ArrayView1<f64>,
        config: &McmcConfig,
    ) -> Result<Array2<f64>, String>;
}

/// Posterior draws together with the model they were drawn for.
#[derive(Debug, Clone)]
pub struct McmcOutput {
    pub model: LogPSplines,
    /// Raw draws of `[weights, ln phi, ln delta]`
    pub samples: Array2<f64>,
    pub runtime: Duration,
}

impl McmcOutput {
    /// Spline weight draws, `[num_draws, n_basis]`.
    pub fn weights(&self) -> ArrayView2<'_, f64> {
        self.samples.slice(s![.., ..self.model.n_basis()])
    }

    /// Draws of the penalty precision `phi`.
    pub fn phi(&self) -> Array1<f64> {
        self.samples.column(self.model.n_basis()).mapv(f64::exp)
    }

    /// Draws of the hyperprior rate `delta`.
    pub fn delta(&self) -> Array1<f64> {
        self.samples.column(self.model.n_basis() + 1).mapv(f64::exp)
    }
}

/// Builds the posterior target for a fitted model and its periodogram.
pub fn build_posterior(
    model: &LogPSplines,
    periodogram: &Periodogram,
    priors: HyperPriors,
) -> Result<LogPosterior, PosteriorError> {
    LogPosterior::new(
        periodogram.log_power(),
        model.basis().to_owned(),
        model.penalty_matrix().to_owned(),
        model.log_parametric_model().to_owned(),
        priors,
    )
}

/// Fits the spline model, then samples its posterior with `sampler`.
///
/// The chain starts at the fitted weights with `delta = alpha_delta / beta_delta`
/// and `phi = alpha_phi / (beta_phi * delta)`.
pub fn run_mcmc<S: PosteriorSampler>(
    periodogram: &Periodogram,
    parametric_model: Option<Array1<f64>>,
    fit_config: &FitConfig,
    config: &McmcConfig,
    sampler: &mut S,
) -> Result<McmcOutput, McmcError> {
    let model = LogPSplines::from_periodogram(periodogram, fit_config, parametric_model)?;
    log::info!("Spline model: {}", model);

    let target = build_posterior(&model, periodogram, config.priors)?;
    let init = target.initial_point(model.weights())?;

    log::info!(
        "Starting sampler: {} warmup, {} samples, seed {}",
        config.num_warmup,
        config.num_samples,
        config.rng_seed
    );
    let start = Instant::now();
    let samples = sampler
        .sample(&target, init.view(), config)
        .map_err(McmcError::SamplerFailed)?;
    let runtime = start.elapsed();

    if samples.ncols() != target.dim() {
        return Err(McmcError::DrawShapeMismatch {
            found: samples.ncols(),
            expected: target.dim(),
        });
    }
    log::info!(
        "Sampling complete: {} draws in {:.2?}",
        samples.nrows(),
        runtime
    );

    Ok(McmcOutput {
        model,
        samples,
        runtime,
    })
}

/// Pointwise median and credible band of the log-PSD curve.
#[derive(Debug, Clone)]
pub struct PosteriorSummary {
    pub median: Array1<f64>,
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
}

impl PosteriorSummary {
    /// Evaluates `log_psd` for every weight draw and takes pointwise
    /// percentiles `lower_pct` and `upper_pct` (in percent).
    pub fn from_weights(
        model: &LogPSplines,
        weights: ArrayView2<f64>,
        lower_pct: f64,
        upper_pct: f64,
    ) -> Result<Self, McmcError> {
        let n_draws = weights.nrows();
        if n_draws == 0 {
            return Err(McmcError::NoDraws);
        }
        if weights.ncols() != model.n_basis() {
            return Err(McmcError::DrawShapeMismatch {
                found: weights.ncols(),
                expected: model.n_basis(),
            });
        }

        let curves: Vec<Array1<f64>> = (0..n_draws)
            .into_par_iter()
            .map(|i| model.log_psd(Some(weights.row(i))))
            .collect();
        let mut stacked = Array2::<f64>::zeros((n_draws, model.n()));
        for (mut row, curve) in stacked.axis_iter_mut(Axis(0)).zip(curves.iter()) {
            row.assign(curve);
        }

        let n = model.n();
        let mut median = Array1::zeros(n);
        let mut lower = Array1::zeros(n);
        let mut upper = Array1::zeros(n);
        for (j, column) in stacked.axis_iter(Axis(1)).enumerate() {
            let mut values = column.to_vec();
            values.sort_by(f64::total_cmp);
            median[j] = percentile(&values, 50.0);
            lower[j] = percentile(&values, lower_pct);
            upper[j] = percentile(&values, upper_pct);
        }

        Ok(Self {
            median,
            lower,
            upper,
        })
    }
}

/// Linear-interpolation percentile of sorted values.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}
