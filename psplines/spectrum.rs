//! # Periodogram Data Source
//!
//! The periodogram is the only data the spline pipeline consumes. It is an
//! ordered set of `(frequency, power)` pairs with strictly increasing
//! frequencies and non-negative, finite power. Every transformation returns a
//! new `Periodogram`; existing values are never mutated.

use ndarray::{Array1, ArrayView1, Zip};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpectrumError {
    #[error("A periodogram requires at least one frequency, but none were provided.")]
    Empty,

    #[error("Frequency and power arrays must have the same length (freqs: {freqs}, power: {power}).")]
    LengthMismatch { freqs: usize, power: usize },

    #[error("Frequencies must be strictly increasing, but freqs[{index}] = {value} does not exceed the previous value.")]
    NonIncreasingFrequency { index: usize, value: f64 },

    #[error("Power must be finite and non-negative, but power[{index}] = {value}.")]
    InvalidPower { index: usize, value: f64 },

    #[error("Scaling curve has {found} entries, but the periodogram has {expected}.")]
    ScaleLengthMismatch { found: usize, expected: usize },

    #[error("Failed to read periodogram file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse periodogram CSV: {0}")]
    CsvError(#[from] csv::Error),
}

/// An empirical power spectral density estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct Periodogram {
    freqs: Array1<f64>,
    power: Array1<f64>,
    filtered: bool,
}

impl Periodogram {
    /// Validates and wraps a frequency/power pair of arrays.
    pub fn new(freqs: Array1<f64>, power: Array1<f64>) -> Result<Self, SpectrumError> {
        if freqs.len() != power.len() {
            return Err(SpectrumError::LengthMismatch {
                freqs: freqs.len(),
                power: power.len(),
            });
        }
        if freqs.is_empty() {
            return Err(SpectrumError::Empty);
        }
        for i in 1..freqs.len() {
            if !(freqs[i] > freqs[i - 1]) {
                return Err(SpectrumError::NonIncreasingFrequency {
                    index: i,
                    value: freqs[i],
                });
            }
        }
        if let Some((index, &value)) = power
            .iter()
            .enumerate()
            .find(|(_, p)| !p.is_finite() || **p < 0.0)
        {
            return Err(SpectrumError::InvalidPower { index, value });
        }

        Ok(Self {
            freqs,
            power,
            filtered: false,
        })
    }

    pub fn freqs(&self) -> ArrayView1<'_, f64> {
        self.freqs.view()
    }

    pub fn power(&self) -> ArrayView1<'_, f64> {
        self.power.view()
    }

    /// Whether this periodogram was produced by `highpass`.
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// Number of frequency bins.
    pub fn n(&self) -> usize {
        self.freqs.len()
    }

    /// Sampling frequency implied by the Nyquist bin: `2 * max(freq)`.
    pub fn fs(&self) -> f64 {
        2.0 * self.freqs[self.freqs.len() - 1]
    }

    pub fn min_freq(&self) -> f64 {
        self.freqs[0]
    }

    pub fn max_freq(&self) -> f64 {
        self.freqs[self.freqs.len() - 1]
    }

    /// Natural log of the power, the target of the spline fit.
    pub fn log_power(&self) -> Array1<f64> {
        self.power.mapv(f64::ln)
    }

    /// Keeps only the bins with frequency strictly above `min_freq`.
    pub fn highpass(&self, min_freq: f64) -> Result<Self, SpectrumError> {
        let keep: Vec<usize> = self
            .freqs
            .iter()
            .enumerate()
            .filter(|(_, f)| **f > min_freq)
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(SpectrumError::Empty);
        }
        let freqs = keep.iter().map(|&i| self.freqs[i]).collect::<Array1<f64>>();
        let power = keep.iter().map(|&i| self.power[i]).collect::<Array1<f64>>();
        Ok(Self {
            freqs,
            power,
            filtered: true,
        })
    }

    /// Multiplies the power by a scalar factor.
    pub fn scaled(&self, factor: f64) -> Result<Self, SpectrumError> {
        Self::new(self.freqs.clone(), &self.power * factor)
    }

    /// Divides the power elementwise by a curve of the same length.
    pub fn divided_by(&self, curve: ArrayView1<f64>) -> Result<Self, SpectrumError> {
        if curve.len() != self.n() {
            return Err(SpectrumError::ScaleLengthMismatch {
                found: curve.len(),
                expected: self.n(),
            });
        }
        let power = Zip::from(&self.power)
            .and(&curve)
            .map_collect(|&p, &c| p / c);
        let mut out = Self::new(self.freqs.clone(), power)?;
        out.filtered = self.filtered;
        Ok(out)
    }
}

/// Welsch-style roll-off `power / (1 + (f / alpha)^2)`, a simple parametric
/// multiplier for the spline model.
pub fn welsch_psd(freqs: ArrayView1<f64>, power: ArrayView1<f64>, alpha: f64) -> Array1<f64> {
    Zip::from(&freqs)
        .and(&power)
        .map_collect(|&f, &p| p / (1.0 + (f / alpha).powi(2)))
}

#[derive(Debug, Deserialize)]
struct PeriodogramRow {
    freq: f64,
    power: f64,
}

/// Reads a `freq,power` CSV file into a validated periodogram.
pub fn load_periodogram(path: impl AsRef<Path>) -> Result<Periodogram, SpectrumError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let mut freqs = Vec::new();
    let mut power = Vec::new();
    for row in reader.deserialize::<PeriodogramRow>() {
        let row = row?;
        freqs.push(row.freq);
        power.push(row.power);
    }
    log::info!(
        "Loaded periodogram with {} bins from {}",
        freqs.len(),
        path.as_ref().display()
    );

    Periodogram::new(Array1::from_vec(freqs), Array1::from_vec(power))
}
