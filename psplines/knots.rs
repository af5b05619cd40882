//! Knot placement for the log-PSD spline.
//!
//! The boundary knots always sit on the first and last frequency. Interior
//! knots are split between three strategies: uniform spacing, logarithmic
//! spacing, and placement at equally spaced quantiles of the power
//! distribution, so that bands carrying more power receive more knots. The
//! result is rescaled onto `[0, 1]`.

use crate::spectrum::Periodogram;
use ndarray::{Array, Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KnotError {
    #[error("At least two knots are required (min and max frequencies), but {n_knots} were requested.")]
    TooFewKnots { n_knots: usize },

    #[error("Knots cannot be normalized: the frequency range [{min}, {max}] has zero width.")]
    DegenerateRange { min: f64, max: f64 },

    #[error("Log-spaced knots require a positive minimum frequency, but it was {0}.")]
    NonPositiveFrequency(f64),

    #[error(
        "Knot allocation does not add up: {uniform} uniform + {log} log + {density} density != {interior} interior knots."
    )]
    AllocationMismatch {
        uniform: usize,
        log: usize,
        density: usize,
        interior: usize,
    },
}

/// Mix of placement strategies for the interior knots. Whatever is not
/// claimed by `frac_uniform` and `frac_log` is placed by power density.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnotOptions {
    pub frac_uniform: f64,
    pub frac_log: f64,
}

impl Default for KnotOptions {
    fn default() -> Self {
        Self {
            frac_uniform: 0.0,
            frac_log: 0.8,
        }
    }
}

/// Number of interior knots assigned to each strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnotAllocation {
    pub uniform: usize,
    pub log: usize,
    pub density: usize,
}

impl KnotOptions {
    /// Splits `n_interior` knots between the three strategies.
    ///
    /// Each fraction is clamped to `[0, 1]` on its own and truncated to a
    /// count. If the clamped fractions overclaim, the log group gives up the
    /// excess so the counts always sum to `n_interior`.
    pub fn allocate(&self, n_interior: usize) -> Result<KnotAllocation, KnotError> {
        let frac_uniform = self.frac_uniform.clamp(0.0, 1.0);
        let frac_log = self.frac_log.clamp(0.0, 1.0);

        let uniform = (frac_uniform * n_interior as f64) as usize;
        let mut log = (frac_log * n_interior as f64) as usize;
        if uniform + log > n_interior {
            log = n_interior - uniform;
        }
        let density = n_interior - uniform - log;

        let allocation = KnotAllocation {
            uniform,
            log,
            density,
        };
        if allocation.uniform + allocation.log + allocation.density != n_interior {
            return Err(KnotError::AllocationMismatch {
                uniform: allocation.uniform,
                log: allocation.log,
                density: allocation.density,
                interior: n_interior,
            });
        }
        Ok(allocation)
    }
}

/// Selects `n_knots` knot locations from the periodogram, normalized to `[0, 1]`.
pub fn init_knots(
    periodogram: &Periodogram,
    n_knots: usize,
    options: &KnotOptions,
) -> Result<Array1<f64>, KnotError> {
    let raw = select_knot_frequencies(periodogram, n_knots, options)?;
    normalize(raw.view())
}

/// Same as `init_knots`, but returns knot locations in frequency units.
pub fn select_knot_frequencies(
    periodogram: &Periodogram,
    n_knots: usize,
    options: &KnotOptions,
) -> Result<Array1<f64>, KnotError> {
    if n_knots < 2 {
        return Err(KnotError::TooFewKnots { n_knots });
    }

    let min_freq = periodogram.min_freq();
    let max_freq = periodogram.max_freq();
    if max_freq <= min_freq {
        return Err(KnotError::DegenerateRange {
            min: min_freq,
            max: max_freq,
        });
    }

    if n_knots == 2 {
        return Ok(Array1::from_vec(vec![min_freq, max_freq]));
    }

    let allocation = options.allocate(n_knots - 2)?;
    log::info!(
        "Placing {} interior knots: {} uniform, {} log-spaced, {} power-density",
        n_knots - 2,
        allocation.uniform,
        allocation.log,
        allocation.density
    );

    let uniform_knots = interior_linspace(min_freq, max_freq, allocation.uniform);
    let log_knots = if allocation.log > 0 {
        if min_freq <= 0.0 {
            return Err(KnotError::NonPositiveFrequency(min_freq));
        }
        interior_linspace(min_freq.log10(), max_freq.log10(), allocation.log)
            .mapv(|e| 10f64.powf(e))
    } else {
        Array1::zeros(0)
    };
    let density_knots = density_knots(periodogram, allocation.density);

    let mut knots = Vec::with_capacity(n_knots);
    knots.push(min_freq);
    knots.extend(uniform_knots.iter());
    knots.extend(log_knots.iter());
    knots.extend(density_knots.iter());
    knots.push(max_freq);
    knots.sort_by(f64::total_cmp);

    Ok(Array1::from_vec(knots))
}

/// Places `count` knots at equally spaced quantiles of the power CDF.
///
/// Falls back to uniform spacing when the periodogram carries no power.
fn density_knots(periodogram: &Periodogram, count: usize) -> Array1<f64> {
    if count == 0 {
        return Array1::zeros(0);
    }

    let freqs = periodogram.freqs();
    let power = periodogram.power();
    let total: f64 = power.sum();
    if total <= 0.0 {
        log::warn!(
            "Periodogram has zero total power; placing {} density knots uniformly instead",
            count
        );
        return interior_linspace(periodogram.min_freq(), periodogram.max_freq(), count);
    }

    let mut running = 0.0;
    let cdf: Array1<f64> = power
        .iter()
        .map(|&p| {
            running += p / total;
            running
        })
        .collect();

    interior_linspace(0.0, 1.0, count).mapv(|q| interp(q, cdf.view(), freqs))
}

/// `count` evenly spaced points strictly between `start` and `end`.
fn interior_linspace(start: f64, end: f64, count: usize) -> Array1<f64> {
    if count == 0 {
        return Array1::zeros(0);
    }
    let full = Array::linspace(start, end, count + 2);
    full.slice(ndarray::s![1..-1]).to_owned()
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`, clamped to the end
/// values outside the table. `xp` must be non-decreasing.
fn interp(x: f64, xp: ArrayView1<f64>, fp: ArrayView1<f64>) -> f64 {
    let last = xp.len() - 1;
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[last] {
        return fp[last];
    }
    // First index with xp[hi] >= x; hi >= 1 since x > xp[0].
    let hi = xp.iter().position(|&v| v >= x).unwrap_or(last);
    let lo = hi - 1;
    let span = xp[hi] - xp[lo];
    if span <= 0.0 {
        return fp[hi];
    }
    let t = (x - xp[lo]) / span;
    fp[lo] + t * (fp[hi] - fp[lo])
}

fn normalize(knots: ArrayView1<f64>) -> Result<Array1<f64>, KnotError> {
    let min = knots[0];
    let max = knots[knots.len() - 1];
    let width = max - min;
    if width <= 0.0 {
        return Err(KnotError::DegenerateRange { min, max });
    }
    Ok(knots.mapv(|k| (k - min) / width))
}
