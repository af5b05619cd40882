use crate::basis::{self, DEFAULT_PENALTY_EPSILON, MAX_DEGREE, MAX_DIFF_ORDER, init_basis_and_penalty};
use crate::initialisation::{self, InitError, WeightInitConfig, init_weights};
use crate::knots::{self, KnotOptions, init_knots};
use crate::spectrum::Periodogram;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// `FitConfig` is the human-editable TOML configuration of a fitting run;
// `LogPSplines` is the fitted model artifact.

/// Everything needed to build a `LogPSplines` model from a periodogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub n_knots: usize,
    pub degree: usize,
    pub diff_matrix_order: usize,
    pub penalty_epsilon: f64,
    pub knots: KnotOptions,
    pub weights: WeightInitConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            n_knots: 10,
            degree: 3,
            diff_matrix_order: 2,
            penalty_epsilon: DEFAULT_PENALTY_EPSILON,
            knots: KnotOptions::default(),
            weights: WeightInitConfig::default(),
        }
    }
}

impl FitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Checks the structural constraints on degree, penalty order and knot
    /// count. Runs before any numeric work.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.n_knots < 2 {
            return Err(ModelError::InvalidConfiguration(format!(
                "n_knots must be at least 2 (min and max frequencies), but was {}",
                self.n_knots
            )));
        }
        validate_structure(self.degree, self.diff_matrix_order, self.n_knots)
    }
}

/// Custom error type for model construction, loading and saving.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Knot selection failed: {0}")]
    KnotError(#[from] knots::KnotError),
    #[error("Basis construction failed: {0}")]
    BasisError(#[from] basis::BasisError),
    #[error("Weight initialization failed: {0}")]
    InitError(#[from] initialisation::InitError),
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

fn validate_structure(degree: usize, diff_matrix_order: usize, n_knots: usize) -> Result<(), ModelError> {
    if degree > MAX_DEGREE {
        return Err(ModelError::InvalidConfiguration(format!(
            "degree must be between 0 and {}, but was {}",
            MAX_DEGREE, degree
        )));
    }
    if diff_matrix_order > MAX_DIFF_ORDER {
        return Err(ModelError::InvalidConfiguration(format!(
            "diffMatrixOrder must be 0, 1, or 2, but was {}",
            diff_matrix_order
        )));
    }
    if degree < diff_matrix_order {
        return Err(ModelError::InvalidConfiguration(format!(
            "degree ({}) must be at least diffMatrixOrder ({})",
            degree, diff_matrix_order
        )));
    }
    if n_knots < degree {
        return Err(ModelError::InvalidConfiguration(format!(
            "number of knots ({}) must be at least the degree ({})",
            n_knots, degree
        )));
    }
    Ok(())
}

/// A penalized B-spline model of a log power spectral density.
///
/// The model is built once per fitting run. After the weight fit its fields
/// are only read; samplers receive copies of the basis, penalty and weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPSplines {
    degree: usize,
    diff_matrix_order: usize,
    n: usize,
    knots: Array1<f64>,
    weights: Array1<f64>,
    basis: Array2<f64>,
    penalty_matrix: Array2<f64>,
    parametric_model: Option<Array1<f64>>,
    /// `ln(parametric_model)`, or zeros when there is none. Filled once at
    /// construction and after loading.
    #[serde(skip)]
    log_parametric_model: Array1<f64>,
}

impl LogPSplines {
    /// Assembles a model from precomputed parts, checking every invariant.
    pub fn new(
        degree: usize,
        diff_matrix_order: usize,
        basis: Array2<f64>,
        penalty_matrix: Array2<f64>,
        knots: Array1<f64>,
        weights: Array1<f64>,
        parametric_model: Option<Array1<f64>>,
    ) -> Result<Self, ModelError> {
        let mut model = Self {
            degree,
            diff_matrix_order,
            n: basis.nrows(),
            knots,
            weights,
            basis,
            penalty_matrix,
            parametric_model,
            log_parametric_model: Array1::zeros(0),
        };
        model.check_invariants()?;
        model.cache_log_parametric();
        Ok(model)
    }

    /// Builds the full model: knots, basis and penalty, then the weight fit
    /// against the log-periodogram.
    pub fn from_periodogram(
        periodogram: &Periodogram,
        config: &FitConfig,
        parametric_model: Option<Array1<f64>>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        if let Some(parametric) = &parametric_model {
            check_parametric(parametric.view(), periodogram.n())?;
        }

        let knots = init_knots(periodogram, config.n_knots, &config.knots)?;
        let (basis, penalty_matrix) = init_basis_and_penalty(
            knots.view(),
            config.degree,
            periodogram.n(),
            config.diff_matrix_order,
            config.penalty_epsilon,
        )?;
        let n_basis = basis.ncols();

        let mut model = Self::new(
            config.degree,
            config.diff_matrix_order,
            basis,
            penalty_matrix,
            knots,
            Array1::zeros(n_basis),
            parametric_model,
        )?;
        let weights = init_weights(periodogram.log_power().view(), &model, None, &config.weights)?;
        model.weights = weights;

        log::info!("Constructed {}", model);
        Ok(model)
    }

    fn check_invariants(&self) -> Result<(), ModelError> {
        validate_structure(self.degree, self.diff_matrix_order, self.n_knots())?;

        let n_basis = self.n_basis();
        if self.basis.ncols() != n_basis {
            return Err(ModelError::InvalidConfiguration(format!(
                "basis has {} columns, expected #knots + degree - 1 = {}",
                self.basis.ncols(),
                n_basis
            )));
        }
        if self.penalty_matrix.dim() != (n_basis, n_basis) {
            return Err(ModelError::InvalidConfiguration(format!(
                "penalty matrix is {:?}, expected ({}, {})",
                self.penalty_matrix.dim(),
                n_basis,
                n_basis
            )));
        }
        if self.weights.len() != n_basis {
            return Err(ModelError::InitError(InitError::WeightLengthMismatch {
                found: self.weights.len(),
                expected: n_basis,
            }));
        }
        if let Some(parametric) = &self.parametric_model {
            check_parametric(parametric.view(), self.n)?;
        }
        Ok(())
    }

    fn cache_log_parametric(&mut self) {
        self.log_parametric_model = match &self.parametric_model {
            Some(parametric) => parametric.mapv(f64::ln),
            None => Array1::zeros(self.n),
        };
    }

    /// Weighted sum of the basis columns. Uses the stored weights when
    /// `weights` is `None`.
    pub fn evaluate(&self, weights: Option<ArrayView1<f64>>) -> Array1<f64> {
        match weights {
            Some(w) => self.basis.dot(&w),
            None => self.basis.dot(&self.weights),
        }
    }

    /// Full log-PSD model: spline plus the log of the parametric multiplier.
    pub fn log_psd(&self, weights: Option<ArrayView1<f64>>) -> Array1<f64> {
        self.evaluate(weights) + &self.log_parametric_model
    }

    pub fn log_parametric_model(&self) -> ArrayView1<'_, f64> {
        self.log_parametric_model.view()
    }

    pub fn parametric_model(&self) -> Option<ArrayView1<'_, f64>> {
        self.parametric_model.as_ref().map(|p| p.view())
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn diff_matrix_order(&self) -> usize {
        self.diff_matrix_order
    }

    /// Spline order, `degree + 1`.
    pub fn order(&self) -> usize {
        self.degree + 1
    }

    /// Grid length, equal to the periodogram length.
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn n_knots(&self) -> usize {
        self.knots.len()
    }

    pub fn n_basis(&self) -> usize {
        (self.n_knots() + self.degree).saturating_sub(1)
    }

    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.knots.view()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    pub fn basis(&self) -> ArrayView2<'_, f64> {
        self.basis.view()
    }

    pub fn penalty_matrix(&self) -> ArrayView2<'_, f64> {
        self.penalty_matrix.view()
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let file = fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(toml_string.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and re-checks its invariants.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let mut model: Self = toml::from_str(&toml_string)?;
        if model.basis.nrows() != model.n {
            return Err(ModelError::InvalidConfiguration(format!(
                "basis has {} rows, but the model grid has {}",
                model.basis.nrows(),
                model.n
            )));
        }
        model.check_invariants()?;
        model.cache_log_parametric();
        Ok(model)
    }
}

fn check_parametric(parametric: ArrayView1<f64>, n: usize) -> Result<(), ModelError> {
    if parametric.len() != n {
        return Err(ModelError::InvalidConfiguration(format!(
            "parametric model has {} entries, but the periodogram has {}",
            parametric.len(),
            n
        )));
    }
    if let Some(bad) = parametric.iter().find(|v| !(**v > 0.0 && v.is_finite())) {
        return Err(ModelError::InvalidConfiguration(format!(
            "parametric model must be positive and finite, found {}",
            bad
        )));
    }
    Ok(())
}

impl fmt::Display for LogPSplines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogPSplines(knots={}, degree={}, n={})",
            self.n_knots(),
            self.degree,
            self.n
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use tempfile::tempdir;

    fn quick_config() -> FitConfig {
        FitConfig {
            n_knots: 8,
            weights: WeightInitConfig {
                num_steps: 500,
                ..WeightInitConfig::default()
            },
            ..FitConfig::default()
        }
    }

    fn decaying_periodogram(n: usize) -> Periodogram {
        let freqs = Array::linspace(1.0, 50.0, n);
        let power = freqs.mapv(|f: f64| 1.0 / (1.0 + (f / 10.0).powi(2)));
        Periodogram::new(freqs, power).unwrap()
    }

    fn expect_invalid(config: FitConfig, needle: &str) {
        let p = decaying_periodogram(32);
        match LogPSplines::from_periodogram(&p, &config, None) {
            Err(ModelError::InvalidConfiguration(msg)) => {
                assert!(msg.contains(needle), "message {:?} lacks {:?}", msg, needle)
            }
            other => panic!("Expected InvalidConfiguration, got {:?}", other.map(|m| m.to_string())),
        }
    }

    #[test]
    fn structural_constraints_fail_fast() {
        expect_invalid(
            FitConfig {
                degree: 1,
                diff_matrix_order: 2,
                ..quick_config()
            },
            "degree (1) must be at least diffMatrixOrder (2)",
        );
        expect_invalid(
            FitConfig {
                degree: 6,
                ..quick_config()
            },
            "was 6",
        );
        expect_invalid(
            FitConfig {
                n_knots: 1,
                ..quick_config()
            },
            "n_knots must be at least 2",
        );
        expect_invalid(
            FitConfig {
                diff_matrix_order: 3,
                degree: 4,
                ..quick_config()
            },
            "diffMatrixOrder must be 0, 1, or 2",
        );
        expect_invalid(
            FitConfig {
                n_knots: 3,
                degree: 5,
                ..quick_config()
            },
            "number of knots (3)",
        );
    }

    #[test]
    fn from_periodogram_builds_consistent_shapes() {
        let p = decaying_periodogram(100);
        let model = LogPSplines::from_periodogram(&p, &quick_config(), None).unwrap();
        assert_eq!(model.n(), 100);
        assert_eq!(model.n_knots(), 8);
        assert_eq!(model.n_basis(), 10);
        assert_eq!(model.order(), 4);
        assert_eq!(model.basis().dim(), (100, 10));
        assert_eq!(model.penalty_matrix().dim(), (10, 10));
        assert_eq!(model.weights().len(), 10);
        assert!(model.weights().iter().all(|w| w.is_finite()));
        assert_eq!(model.to_string(), "LogPSplines(knots=8, degree=3, n=100)");
    }

    #[test]
    fn evaluate_defaults_to_stored_weights() {
        let p = decaying_periodogram(50);
        let model = LogPSplines::from_periodogram(&p, &quick_config(), None).unwrap();
        let stored = model.evaluate(None);
        let explicit = model.evaluate(Some(model.weights()));
        assert_eq!(stored, explicit);

        let ones = Array1::ones(model.n_basis());
        let manual = model.basis().dot(&ones);
        assert_eq!(model.evaluate(Some(ones.view())), manual);
    }

    #[test]
    fn log_parametric_defaults_to_zero() {
        let p = decaying_periodogram(40);
        let model = LogPSplines::from_periodogram(&p, &quick_config(), None).unwrap();
        assert!(model.parametric_model().is_none());
        assert_eq!(model.log_parametric_model(), Array1::<f64>::zeros(40).view());
        assert_eq!(model.log_psd(None), model.evaluate(None));
    }

    #[test]
    fn parametric_model_is_logged_once() {
        let p = decaying_periodogram(40);
        let parametric = Array1::from_elem(40, std::f64::consts::E);
        let model = LogPSplines::from_periodogram(&p, &quick_config(), Some(parametric)).unwrap();
        for &v in model.log_parametric_model().iter() {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
        let diff = model.log_psd(None) - model.evaluate(None);
        for &d in diff.iter() {
            assert_abs_diff_eq!(d, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn nonpositive_parametric_model_is_rejected() {
        let p = decaying_periodogram(4);
        let config = FitConfig {
            n_knots: 3,
            degree: 2,
            ..quick_config()
        };
        let err = LogPSplines::from_periodogram(&p, &config, Some(array![1.0, 0.0, 1.0, 1.0]));
        assert!(matches!(err, Err(ModelError::InvalidConfiguration(_))));
        let err = LogPSplines::from_periodogram(&p, &config, Some(array![1.0, 1.0]));
        assert!(matches!(err, Err(ModelError::InvalidConfiguration(_))));
    }

    #[test]
    fn new_rejects_mismatched_parts() {
        let knots = Array::linspace(0.0, 1.0, 5);
        let err = LogPSplines::new(3, 2, Array2::zeros((10, 7)), Array2::eye(7), knots.clone(), Array1::zeros(5), None);
        assert!(matches!(
            err,
            Err(ModelError::InitError(InitError::WeightLengthMismatch { found: 5, expected: 7 }))
        ));
        let err = LogPSplines::new(3, 2, Array2::zeros((10, 6)), Array2::eye(7), knots, Array1::zeros(7), None);
        assert!(matches!(err, Err(ModelError::InvalidConfiguration(_))));
    }

    #[test]
    fn save_and_load_preserves_the_model() {
        let p = decaying_periodogram(30);
        let parametric = Array1::from_elem(30, 2.0);
        let model = LogPSplines::from_periodogram(&p, &quick_config(), Some(parametric)).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("model.toml");
        model.save(&path).unwrap();
        let loaded = LogPSplines::load(&path).unwrap();

        assert_eq!(loaded.to_string(), model.to_string());
        assert_eq!(loaded.knots(), model.knots());
        assert_eq!(loaded.weights(), model.weights());
        assert_eq!(loaded.basis(), model.basis());
        assert_eq!(loaded.penalty_matrix(), model.penalty_matrix());
        assert_eq!(loaded.log_parametric_model(), model.log_parametric_model());
    }

    #[test]
    fn fit_config_parses_partial_toml() {
        let config = FitConfig::from_toml_str(
            r#"
            n_knots = 20
            degree = 2

            [knots]
            frac_uniform = 0.5
            frac_log = 0.25

            [weights]
            num_steps = 100
            learning_rate = 0.05
            optimizer = "Adam"
            "#,
        )
        .unwrap();
        assert_eq!(config.n_knots, 20);
        assert_eq!(config.degree, 2);
        assert_eq!(config.diff_matrix_order, 2);
        assert_abs_diff_eq!(config.knots.frac_uniform, 0.5);
        assert_eq!(config.weights.num_steps, 100);
        assert_eq!(config.weights.optimizer, crate::initialisation::WeightOptimizer::Adam);
    }

    #[test]
    fn nested_tables_may_be_partial() {
        let config = FitConfig::from_toml_str(
            r#"
            [knots]
            frac_log = 0.5

            [weights]
            num_steps = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.n_knots, 10);
        assert_eq!(config.knots.frac_uniform, 0.0);
        assert_eq!(config.knots.frac_log, 0.5);
        assert_eq!(config.weights.num_steps, 100);
        assert_eq!(config.weights.learning_rate, 1e-2);
        assert_eq!(config.weights.optimizer, crate::initialisation::WeightOptimizer::Adam);
    }

    #[test]
    fn fit_config_round_trips_through_toml() {
        let config = FitConfig {
            weights: WeightInitConfig {
                optimizer: crate::initialisation::WeightOptimizer::Bfgs {
                    tolerance: 1e-7,
                    max_iterations: 50,
                },
                ..WeightInitConfig::default()
            },
            ..FitConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(FitConfig::from_toml_str(&text).unwrap(), config);
    }
}
